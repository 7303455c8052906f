use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use derive_where::derive_where;

use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_CONNECTING: u32 = 2;
pub(crate) const DEFAULT_MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(100);

/// Sizing and expiry settings, with zero and absent options already resolved.
#[derive(Debug, Clone, Copy)]
struct PoolLimits {
    /// `None` means unbounded.
    max_pool_size: Option<u32>,
    min_pool_size: u32,
    max_connecting: u32,
    /// `None` means connections never expire from idleness.
    max_idle_time: Option<Duration>,
    maintenance_frequency: Duration,
}

impl PoolLimits {
    fn new(options: Option<&ConnectionPoolOptions>) -> Self {
        Self {
            max_pool_size: match options.and_then(|o| o.max_pool_size) {
                Some(0) => None,
                Some(size) => Some(size),
                None => Some(DEFAULT_MAX_POOL_SIZE),
            },
            min_pool_size: options.and_then(|o| o.min_pool_size).unwrap_or(0),
            max_connecting: options
                .and_then(|o| o.max_connecting)
                .unwrap_or(DEFAULT_MAX_CONNECTING),
            max_idle_time: options
                .and_then(|o| o.max_idle_time)
                .filter(|time| !time.is_zero()),
            maintenance_frequency: options
                .and_then(|o| o.maintenance_frequency)
                .unwrap_or(DEFAULT_MAINTENANCE_FREQUENCY),
        }
    }
}

/// Owns the state of one pool. Runs as its own task and is driven entirely by messages from
/// [`ConnectionRequester`]s and [`PoolManager`]s, plus a maintenance tick.
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolWorker {
    address: ServerAddress,

    state: PoolState,

    limits: PoolLimits,

    /// Every connection the pool is responsible for: available, checked out, or establishing.
    total_connection_count: u32,

    pending_connection_count: u32,

    next_connection_id: u32,

    generation: PoolGeneration,

    /// Idle connections, least recently checked in at the front.
    available_connections: VecDeque<PooledConnection>,

    #[derive_where(skip)]
    establisher: ConnectionEstablisher,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,

    handle_listener: WorkerHandleListener,

    request_receiver: ConnectionRequestReceiver,

    /// Check outs accepted while the pool was ready, in arrival order.
    wait_queue: VecDeque<ConnectionRequest>,

    management_receiver: ManagementRequestReceiver,

    generation_publisher: PoolGenerationPublisher,

    /// Read by establishing tasks to catch clears that happened while they ran.
    generation_subscriber: PoolGenerationSubscriber,

    /// Attached to each connection handed out, so that dropping it checks it back in.
    manager: PoolManager,

    /// Establishment failures are reported here so the server can be marked unknown.
    #[derive_where(skip)]
    topology_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Spawns the worker. It runs until the pool is closed or the last requester is dropped.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        let limits = PoolLimits::new(options.as_ref());
        let load_balanced = options
            .as_ref()
            .and_then(|o| o.load_balanced)
            .unwrap_or(false);

        // Nothing monitors a load balanced pool, so nothing would ever mark it ready.
        let (generation, state) = if load_balanced {
            (PoolGeneration::load_balanced(), PoolState::Ready)
        } else {
            (
                PoolGeneration::normal(),
                PoolState::Paused(Error::pool_paused_error(&address)),
            )
        };

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) =
            status::channel(generation.clone(), state.paused_error());

        let worker = ConnectionPoolWorker {
            address,
            state,
            limits,
            total_connection_count: 0,
            pending_connection_count: 0,
            next_connection_id: 1,
            generation,
            available_connections: VecDeque::new(),
            establisher,
            event_emitter,
            handle_listener,
            request_receiver,
            wait_queue: VecDeque::new(),
            management_receiver,
            generation_publisher,
            generation_subscriber: generation_subscriber.clone(),
            manager: manager.clone(),
            topology_updater,
        };
        runtime::execute(worker.execute());

        (manager, connection_requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.limits.maintenance_frequency);
        let mut close_handler = None;

        loop {
            let task = tokio::select! {
                // Check-ins are applied before the requests queued behind them, and queued
                // requests are seen before the handles are found dead.
                biased;

                Some(request) = self.management_receiver.recv() => request.into(),
                Some(request) = self.request_receiver.recv() => PoolTask::CheckOut(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                _ = maintenance_interval.tick() => PoolTask::Maintenance,
                else => break,
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => self.wait_queue.push_back(request),
                    PoolState::Paused(ref error) => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(error.clone()));
                    }
                    PoolState::Closed => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolClosed);
                    }
                },
                PoolTask::HandleManagementRequest(request) => match *request {
                    PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
                    // `done` is dropped after the arm runs, acknowledging the request.
                    PoolManagementRequest::Clear {
                        done: _,
                        cause,
                        service_id,
                    } => self.clear(cause, service_id),
                    PoolManagementRequest::MarkAsReady { done: _ } => self.mark_as_ready(),
                    PoolManagementRequest::Close { done } => {
                        close_handler = Some(done);
                        break;
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn)
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed()
                    }
                },
                PoolTask::Maintenance => self.perform_maintenance(),
            }

            self.service_wait_queue();
        }

        self.close();
        if let Some(handler) = close_handler {
            handler.acknowledge(());
        }
    }

    /// Hands out connections to the front of the queue for as long as that is possible.
    fn service_wait_queue(&mut self) {
        // Requesters that gave up, usually on their deadline, leave the queue.
        self.wait_queue.retain(|request| !request.is_closed());

        while matches!(self.state, PoolState::Ready)
            && (!self.available_connections.is_empty() || self.can_establish())
        {
            match self.wait_queue.pop_front() {
                Some(request) => self.check_out(request),
                None => break,
            }
        }
    }

    /// Whether another connection may start establishing without exceeding the size or
    /// concurrency limits.
    fn can_establish(&self) -> bool {
        self.limits
            .max_pool_size
            .is_none_or(|max| self.total_connection_count < max)
            && self.pending_connection_count < self.limits.max_connecting
    }

    /// Why `conn` may no longer be handed out, if it may not.
    fn perished(&self, conn: &PooledConnection) -> Option<ConnectionClosedReason> {
        if conn.is_stale(&self.generation) {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_idle(self.limits.max_idle_time) {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    /// Pops the most recently checked in connection that is still usable, closing perished ones
    /// on the way.
    fn pop_available(&mut self) -> Option<PooledConnection> {
        while let Some(conn) = self.available_connections.pop_back() {
            match self.perished(&conn) {
                Some(reason) => self.close_connection(conn, reason),
                None => return Some(conn),
            }
        }
        None
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        if let Some(mut conn) = self.pop_available() {
            conn.mark_as_in_use(self.manager.clone());
            let result = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn)));
            // The requester stopped listening, so the connection goes straight back.
            if let Err(ConnectionRequestResult::Pooled(mut conn)) = result {
                conn.mark_as_available();
                self.available_connections.push_back(*conn);
            }
            return;
        }

        if !self.can_establish() {
            // Retried first the next time the queue is serviced.
            self.wait_queue.push_front(request);
            return;
        }

        let establishing = self.start_establishing();
        let manager = self.manager.clone();
        let status = self.generation_subscriber.clone();
        let handle = runtime::spawn(async move {
            let mut connection = establishing.await?;
            // A clear while establishing leaves this connection in a generation the pool no
            // longer hands out.
            if connection.is_stale(&status.generation()) {
                manager.handle_connection_succeeded(ConnectionSucceeded::Superseded(Box::new(
                    connection,
                )));
                return Err(status
                    .last_cleared()
                    .unwrap_or_else(|| Error::internal("stale connection without a pool clear")));
            }
            connection.mark_as_in_use(manager.clone());
            manager.handle_connection_succeeded(ConnectionSucceeded::Used);
            Ok::<_, Error>(connection)
        });
        // If the requester already gave up, the connection finishes establishing anyway and
        // checks itself in when it is dropped.
        let _ = request.fulfill(ConnectionRequestResult::Establishing(handle));
    }

    /// Reserves a slot for a new connection and returns the future that establishes it.
    fn start_establishing(
        &mut self,
    ) -> impl std::future::Future<Output = Result<PooledConnection>> + Send + 'static {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
            time_created: Instant::now(),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit_event(|| pending_connection.created_event().into());

        let establisher = self.establisher.clone();
        let updater = self.topology_updater.clone();
        let manager = self.manager.clone();
        let event_emitter = self.event_emitter.clone();
        async move {
            establish_connection(
                &establisher,
                pending_connection,
                &updater,
                &manager,
                event_emitter,
            )
            .await
        }
    }

    fn handle_connection_failed(&mut self) {
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        let mut connection = match connection {
            ConnectionSucceeded::Used => return,
            ConnectionSucceeded::Superseded(connection) => {
                self.close_connection(*connection, ConnectionClosedReason::Stale);
                return;
            }
            ConnectionSucceeded::ForPool(connection) => *connection,
        };
        connection.mark_as_available();
        if connection.is_stale(&self.generation) {
            self.close_connection(connection, ConnectionClosedReason::Stale);
        } else {
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: PooledConnection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());
        conn.mark_as_available();

        let close_reason = if conn.has_errored() {
            Some(ConnectionClosedReason::Error)
        } else if conn.is_stale(&self.generation) {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_executing() {
            // Dropped mid-command, so the stream may hold an unread reply.
            Some(ConnectionClosedReason::Dropped)
        } else {
            None
        };
        match close_reason {
            Some(reason) => self.close_connection(conn, reason),
            None => self.available_connections.push_back(conn),
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>) {
        let cleared = Error::pool_cleared_error(&self.address, &cause);
        let was_ready = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(generation), None) => {
                *generation += 1;
                let paused = PoolState::Paused(cleared.clone());
                matches!(std::mem::replace(&mut self.state, paused), PoolState::Ready)
            }
            // Load balanced pools are never paused. Only the service's connections go stale.
            (PoolGeneration::LoadBalanced(generations), Some(service_id)) => {
                *generations.entry(service_id).or_insert(0) += 1;
                true
            }
            (generation, service_id) => {
                tracing::warn!(
                    address = %self.address,
                    ?generation,
                    ?service_id,
                    "ignoring pool clear with mismatched load balancing mode"
                );
                return;
            }
        };
        let generation = self.generation.clone();
        let paused = self.state.paused_error();
        self.generation_publisher.publish(|status| {
            status.generation = generation;
            status.last_cleared = Some(cleared);
            status.paused = paused;
        });

        if !was_ready {
            return;
        }
        self.event_emitter.emit_event(|| {
            PoolClearedEvent {
                address: self.address.clone(),
                service_id,
            }
            .into()
        });

        if let PoolState::Paused(ref error) = self.state {
            for request in self.wait_queue.drain(..) {
                let _ = request.fulfill(ConnectionRequestResult::PoolCleared(error.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if let PoolState::Paused(_) = self.state {
            self.state = PoolState::Ready;
            self.generation_publisher.publish(|status| status.paused = None);
            self.event_emitter.emit_event(|| {
                PoolReadyEvent {
                    address: self.address.clone(),
                }
                .into()
            });
        }
    }

    /// Connections still checked out close themselves when dropped, since check-in fails once
    /// the worker is gone.
    fn close(&mut self) {
        self.state = PoolState::Closed;
        self.generation_publisher.publish(|status| status.paused = None);

        for request in self.wait_queue.drain(..) {
            let _ = request.fulfill(ConnectionRequestResult::PoolClosed);
        }
        for connection in self.available_connections.drain(..) {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn close_connection(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Closes perished connections from the front of the available set. Connections behind the
    /// first usable one were checked in later, so they are usable too.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            match self.perished(&connection) {
                Some(reason) => self.close_connection(connection, reason),
                None => {
                    self.available_connections.push_front(connection);
                    break;
                }
            }
        }
    }

    /// Starts establishing connections until `min_pool_size` is covered.
    fn ensure_min_connections(&mut self) {
        while self.total_connection_count < self.limits.min_pool_size
            && self.pending_connection_count < self.limits.max_connecting
        {
            let establishing = self.start_establishing();
            let manager = self.manager.clone();
            runtime::execute(async move {
                if let Ok(connection) = establishing.await {
                    manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                        connection,
                    )));
                }
            });
        }
    }
}

/// Establishes `pending_connection` and emits its ready or closed event. Failures are also
/// reported to the topology and to the pool.
async fn establish_connection(
    establisher: &ConnectionEstablisher,
    pending_connection: PendingConnection,
    topology_updater: &TopologyUpdater,
    manager: &PoolManager,
    event_emitter: CmapEventEmitter,
) -> Result<PooledConnection> {
    let connection_id = pending_connection.id;
    let address = pending_connection.address.clone();

    match establisher.establish_connection(pending_connection).await {
        Ok(connection) => {
            event_emitter.emit_event(|| connection.ready_event().into());
            Ok(connection)
        }
        Err(failure) => {
            event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address: address.clone(),
                    reason: ConnectionClosedReason::Error,
                    connection_id,
                    error: Some(failure.cause.clone()),
                }
                .into()
            });
            topology_updater
                .handle_application_error(address, failure.cause.clone(), failure.handshake_phase)
                .await;
            manager.handle_connection_failed();
            Err(failure.cause)
        }
    }
}

/// The generation of a pool, compared against the generations of its connections to detect
/// connections that were created before the pool was last cleared.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }

    #[cfg(test)]
    pub(crate) fn as_normal(&self) -> Option<u32> {
        match self {
            PoolGeneration::Normal(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum PoolState {
    /// Check outs fail with the contained error and `min_pool_size` is not maintained.
    Paused(Error),

    Ready,

    Closed,
}

impl PoolState {
    fn paused_error(&self) -> Option<Error> {
        match self {
            PoolState::Paused(error) => Some(error.clone()),
            _ => None,
        }
    }
}

/// One unit of work for the worker loop.
#[derive(Debug)]
enum PoolTask {
    HandleManagementRequest(Box<PoolManagementRequest>),

    CheckOut(ConnectionRequest),

    /// Close perished connections and top the pool up to `min_pool_size`.
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(Box::new(request))
    }
}
