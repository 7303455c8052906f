
pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use derive_where::derive_where;

pub use self::conn::{pooled::PooledConnection, Connection};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    status::PoolGenerationSubscriber,
    worker::ConnectionPoolWorker,
};
pub(crate) use self::{
    conn::ConnectionGeneration,
    worker::PoolGeneration,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::{
        cmap::{
            CmapEvent,
            CmapEventEmitter,
            ConnectionCheckoutFailedEvent,
            ConnectionCheckoutFailedReason,
            ConnectionCheckoutStartedEvent,
            PoolCreatedEvent,
        },
        EventHandler,
    },
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

#[cfg(test)]
use crate::runtime::WorkerHandle;

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A checkout failure, paired with the reason reported in its event.
type CheckoutFailure = (Error, ConnectionCheckoutFailedReason);

/// Handle to the connection pool of one server. The pool itself is run by a worker task. Clones
/// share that worker, and the worker stops once every clone is gone.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,

    /// Never zero. A zero option means no limit.
    wait_queue_timeout: Option<Duration>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    /// Starts the pool worker. The pool begins paused and hands out nothing until
    /// [`mark_as_ready`](Self::mark_as_ready) is called.
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        topology_id: ObjectId,
        options: Option<ConnectionPoolOptions>,
        event_handler: Option<EventHandler<CmapEvent>>,
    ) -> Self {
        let event_emitter = CmapEventEmitter::new(event_handler, topology_id);
        let wait_queue_timeout = options
            .as_ref()
            .and_then(|options| options.wait_queue_timeout)
            .filter(|timeout| !timeout.is_zero());

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            topology_updater,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
                options,
            }
            .into()
        });

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
            event_emitter,
        }
    }

    /// A pool whose worker never runs. Only good for selection tests.
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (manager, _) = manager::channel();
        let (connection_requester, _) = connection_requester::channel(WorkerHandle::new_mocked());
        let (_, generation_subscriber) = status::channel(PoolGeneration::normal(), None);

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout: None,
            event_emitter: CmapEventEmitter::new(None, ObjectId::new()),
        }
    }

    /// The earlier of the caller's deadline and the wait queue timeout measured from `start`.
    fn checkout_deadline(&self, start: Instant, deadline: Option<Instant>) -> Option<Instant> {
        let queue_deadline = self.wait_queue_timeout.map(|timeout| start + timeout);
        match (deadline, queue_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Waits in the pool's queue for a connection, either an idle one or one opened for this
    /// request. Fails with `WaitQueueTimeout` once the deadline passes, without waiting at all
    /// if it already has. A paused pool reports its pool-cleared error ahead of an expired
    /// deadline.
    pub(crate) async fn check_out(&self, deadline: Option<Instant>) -> Result<PooledConnection> {
        let start = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let result = match self.checkout_deadline(start, deadline) {
            None => self.request_connection().await,
            Some(deadline) if deadline <= start => Err(match self.generation_subscriber.paused() {
                Some(error) => (error, ConnectionCheckoutFailedReason::ConnectionError),
                None => self.timeout_failure(),
            }),
            Some(deadline) => runtime::timeout(deadline - start, self.request_connection())
                .await
                .unwrap_or_else(|_| Err(self.timeout_failure())),
        };

        let (error, reason) = match result {
            Ok(conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event(start).into());
                return Ok(conn);
            }
            Err(failure) => failure,
        };
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutFailedEvent {
                address: self.address.clone(),
                reason,
                error: Some(error.clone()),
                duration: start.elapsed(),
            }
            .into()
        });
        Err(error)
    }

    async fn request_connection(&self) -> std::result::Result<PooledConnection, CheckoutFailure> {
        use ConnectionCheckoutFailedReason::{ConnectionError, PoolClosed};

        match self.connection_requester.request().await {
            ConnectionRequestResult::Pooled(conn) => Ok(*conn),
            ConnectionRequestResult::Establishing(task) => {
                task.await.map_err(|error| (error, ConnectionError))
            }
            ConnectionRequestResult::PoolCleared(error) => Err((error, ConnectionError)),
            ConnectionRequestResult::PoolClosed => {
                Err((Error::pool_closed_error(&self.address), PoolClosed))
            }
        }
    }

    fn timeout_failure(&self) -> CheckoutFailure {
        let error = ErrorKind::WaitQueueTimeout {
            address: self.address.clone(),
        };
        (error.into(), ConnectionCheckoutFailedReason::Timeout)
    }

    /// Pauses the pool and moves it to a new generation. Connections from older generations are
    /// closed when they are checked in or reached by maintenance.
    pub(crate) async fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        self.manager.clear(cause, service_id).await
    }

    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await
    }

    /// Fails every waiter, closes the idle connections and stops the worker. Resolves once that
    /// is done.
    pub(crate) async fn close(&self) {
        if let Some(closed) = self.manager.close() {
            closed.wait_for_acknowledgment().await;
        }
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }
}
