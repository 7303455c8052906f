use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use derive_where::derive_where;
use tokio::sync::{
    broadcast,
    mpsc::{UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::topology::server_selection::{attempt_to_select_server, SelectedServer},
    monitor::{Monitor, MonitorHandle},
    DefaultStalenessEstimator,
    Server,
    ServerDescription,
    StalenessEstimator,
    TopologyDescription,
};
use crate::{
    cmap::{
        establish::ConnectionEstablisher,
        options::ConnectionPoolOptions,
        ConnectionGeneration,
        ConnectionPool,
        PoolGeneration,
        PooledConnection,
    },
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    sdam::{public::ServerInfo, ServerType, TopologyType},
    selection_criteria::SelectionCriteria,
    trace::server_selection::ServerSelectionEventEmitter,
    transport::{Authenticator, Transport},
};

/// A handle to a monitored deployment.
///
/// Creating a `Topology` starts a monitor for every known server and a connection pool for each
/// of them. The handle is cheap to clone; once every clone has been dropped the topology shuts
/// itself down in the background. Use [`Topology::shutdown`] to wait for the shutdown to finish.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct Topology {
    id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    update_requester: UpdateRequester,
    server_selection_timeout: Duration,

    #[derive_where(skip)]
    staleness_estimator: Arc<dyn StalenessEstimator>,

    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Starts monitoring the deployment described by `options`.
    ///
    /// `transport` opens the channels used by both monitors and pools. When a credential is
    /// configured, `authenticator` is run on every new pooled connection.
    ///
    /// This must be called from within a tokio runtime.
    pub fn new(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Topology> {
        options.validate()?;

        let id = ObjectId::new();
        let description = TopologyDescription::new(&options);
        let connection_establisher = ConnectionEstablisher::new(&options, transport, authenticator);
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handler.clone(), id);

        let (updater, update_receiver) = TopologyUpdater::channel();
        let update_requester = UpdateRequester::new();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let (watcher, broadcaster) = TopologyWatcher::channel(TopologyState {
            description: TopologyDescription::default(),
            servers: HashMap::new(),
        });

        let staleness_estimator = options
            .staleness_estimator
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultStalenessEstimator));
        let server_selection_timeout = options.server_selection_timeout();

        let mut worker = TopologyWorker {
            id,
            update_receiver,
            broadcaster,
            handle_listener,
            update_requester: update_requester.clone(),
            options,
            connection_establisher,
            event_emitter,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            monitors: HashMap::new(),
        };

        worker
            .event_emitter
            .emit(|| TopologyOpeningEvent { topology_id: id }.into());
        worker.initialize(description);
        runtime::execute(worker.execute());

        Ok(Topology {
            id,
            watcher,
            updater,
            update_requester,
            server_selection_timeout,
            staleness_estimator,
            _worker_handle: worker_handle,
        })
    }

    /// The unique ID of this topology, as reported in its events.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The most recently published description of the deployment.
    pub fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    /// Selects a server matching `criteria`, waiting for the topology to change if none does.
    ///
    /// Selection gives up at the earlier of `deadline` and the configured server selection
    /// timeout. With a sharded deployment, `deprioritized` is only selected if it is the sole
    /// suitable candidate.
    pub async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        deadline: Option<Instant>,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<ServerAddress> {
        let selected = self
            .select_server_inner(criteria, deadline, deprioritized)
            .await?;
        Ok(selected.address().clone())
    }

    pub(crate) async fn select_server_inner(
        &self,
        criteria: &SelectionCriteria,
        deadline: Option<Instant>,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let start_time = Instant::now();
        let timeout_deadline = start_time + self.server_selection_timeout;
        let deadline = match deadline {
            Some(deadline) => deadline.min(timeout_deadline),
            None => timeout_deadline,
        };

        let event_emitter =
            ServerSelectionEventEmitter::new(self.id, criteria, start_time, deadline);
        let mut watcher = self.watch();
        event_emitter.emit_started_event(&watcher.borrow_latest().description);

        let mut emitted_waiting_message = false;
        loop {
            if !watcher.is_alive() {
                let error: Error = ErrorKind::Shutdown.into();
                event_emitter.emit_failed_event(&watcher.borrow_latest().description, &error);
                return Err(error);
            }

            let state = watcher.observe_latest();
            let result = attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
                self.staleness_estimator.as_ref(),
            );

            match result {
                Err(error) => {
                    event_emitter.emit_failed_event(&state.description, &error);
                    return Err(error);
                }
                Ok(Some(server)) => {
                    event_emitter.emit_succeeded_event(&state.description, &server);
                    return Ok(server);
                }
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let error = Error::server_selection(
                            state.description.server_selection_timeout_error_message(
                                criteria,
                                self.staleness_estimator.as_ref(),
                            ),
                        );
                        event_emitter.emit_failed_event(&state.description, &error);
                        return Err(error);
                    }

                    if !emitted_waiting_message {
                        event_emitter.emit_waiting_event(&state.description);
                        emitted_waiting_message = true;
                    }

                    self.request_update();
                    watcher.wait_for_update(deadline - now).await;
                }
            }
        }
    }

    /// Checks out a connection to the server at `address`.
    ///
    /// The checkout waits at most until `deadline`, further bounded by the pool's wait queue
    /// timeout when one is configured.
    pub async fn check_out(
        &self,
        address: &ServerAddress,
        deadline: Option<Instant>,
    ) -> Result<PooledConnection> {
        let server = match self.watcher.server(address) {
            Some(server) => server,
            None => {
                return Err(Error::server_selection(format!(
                    "{} is not a member of the topology",
                    address
                )))
            }
        };

        let selected_server = SelectedServer::new(server);
        let mut connection = selected_server.pool.check_out(deadline).await?;
        connection.selected_server = Some(selected_server);
        Ok(connection)
    }

    /// Selects a server matching `criteria` and checks out a connection to it. Both steps share
    /// the same `deadline`.
    pub async fn select_and_check_out(
        &self,
        criteria: &SelectionCriteria,
        deadline: Option<Instant>,
    ) -> Result<PooledConnection> {
        let selected_server = self.select_server_inner(criteria, deadline, None).await?;
        let mut connection = selected_server.pool.check_out(deadline).await?;
        connection.selected_server = Some(selected_server);
        Ok(connection)
    }

    /// Reports an error encountered while running an operation against the server at `address`.
    ///
    /// The error is attributed to the server's current connection generation. Depending on the
    /// error, the server may be marked unknown, its pool cleared and an immediate check
    /// requested. In load balanced mode, use [`Topology::report_connection_error`] instead so
    /// that the error can be attributed to a backend.
    pub async fn report_error(&self, address: &ServerAddress, error: Error) -> bool {
        let (generation, max_wire_version) = {
            let state = self.watcher.borrow_latest();
            let generation = match state.servers.get(address) {
                Some(server) => server.pool.generation(),
                None => return false,
            };
            let max_wire_version = state
                .description
                .get_server_description(address)
                .and_then(|sd| sd.max_wire_version().ok().flatten())
                .unwrap_or(0);
            (generation, max_wire_version)
        };

        let generation = match generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };

        self.updater
            .handle_application_error(
                address.clone(),
                error,
                HandshakePhase::AfterCompletion {
                    generation,
                    max_wire_version,
                },
            )
            .await
    }

    /// Reports an error encountered while running an operation on `connection`.
    pub async fn report_connection_error(&self, connection: &PooledConnection, error: Error) -> bool {
        self.updater
            .handle_application_error(
                connection.address().clone(),
                error,
                HandshakePhase::after_completion(connection),
            )
            .await
    }

    /// Asks every monitor to check its server as soon as its minimum heartbeat frequency allows.
    pub fn request_update(&self) {
        self.update_requester.request()
    }

    /// Shuts the topology down, stopping every monitor and closing every pool. Resolves once the
    /// shutdown has completed. Selections started afterwards fail with
    /// [`ErrorKind::Shutdown`].
    pub async fn shutdown(&self) {
        self.updater.send_message(UpdateMessage::Shutdown).await;
    }

    fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // mark the latest topology as seen
        watcher.receiver.borrow_and_update();
        watcher
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

/// The single writer of the topology's state. Every change to the description goes through
/// this task, which publishes each new snapshot to the watchers.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: TopologyUpdateReceiver,
    broadcaster: TopologyBroadcaster,
    handle_listener: WorkerHandleListener,
    update_requester: UpdateRequester,
    options: ClientOptions,
    connection_establisher: ConnectionEstablisher,
    event_emitter: SdamEventEmitter,

    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,

    monitors: HashMap<ServerAddress, MonitorHandle>,
}

impl TopologyWorker {
    /// Publishes the initial description, starting the servers for the seed list.
    fn initialize(&mut self, description: TopologyDescription) {
        let mut state = self.broadcaster.clone_latest();
        let old_description = state.description.clone();
        state.description = description;

        for address in state.description.server_addresses() {
            state
                .servers
                .insert(address.clone(), self.start_server(address.clone()));
        }

        self.process_topology_diff(&old_description, &state.description);
        self.broadcaster.publish_new_state(state);
    }

    async fn execute(mut self) {
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                Some(update) = self.update_receiver.recv() => {
                    let (update, ack) = update.into_parts();
                    let changed = match update {
                        UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                        UpdateMessage::MonitorError { address, error } => {
                            self.handle_monitor_error(address, error).await
                        }
                        UpdateMessage::ApplicationError {
                            address,
                            error,
                            phase,
                        } => self.handle_application_error(address, error, phase).await,
                        UpdateMessage::Shutdown => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                    };
                    ack.acknowledge(changed);
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
            }
        }

        self.shutdown().await;

        // Dropping the worker drops the broadcaster, which tells every watcher that the topology
        // is gone.
        drop(self);
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(true);
        }
    }

    async fn shutdown(&mut self) {
        self.monitors.clear();

        let state = self.broadcaster.clone_latest();
        for (address, server) in state.servers.iter() {
            server.pool.close().await;
            self.event_emitter.emit(|| {
                ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        self.event_emitter
            .emit(|| TopologyClosedEvent { topology_id: self.id }.into());
        tracing::debug!(topology_id = %self.id, "topology closed");
    }

    /// Creates the server for `address`, starting its monitor unless the topology is load
    /// balanced.
    fn start_server(&mut self, address: ServerAddress) -> Arc<Server> {
        let pool = ConnectionPool::new(
            address.clone(),
            self.connection_establisher.clone(),
            self.topology_updater.clone(),
            self.id,
            Some(ConnectionPoolOptions::from_client_options(&self.options)),
            self.options.cmap_event_handler.clone(),
        );
        let server = Server::new(address.clone(), pool);

        if !self.options.is_load_balanced() {
            let handle = Monitor::start(
                address.clone(),
                self.topology_updater.clone(),
                self.topology_watcher.clone(),
                self.update_requester.subscribe(),
                self.event_emitter.clone(),
                self.options.clone(),
                self.connection_establisher.clone(),
            );
            self.monitors.insert(address, handle);
        }

        server
    }

    /// Makes the set of servers and monitors match the addresses in the description.
    async fn sync_servers(&mut self, state: &mut TopologyState) {
        let removed: Vec<ServerAddress> = state
            .servers
            .keys()
            .filter(|address| state.description.get_server_description(address).is_none())
            .cloned()
            .collect();
        for address in removed {
            self.monitors.remove(&address);
            if let Some(server) = state.servers.remove(&address) {
                server.pool.close().await;
            }
        }

        let added: Vec<ServerAddress> = state
            .description
            .server_addresses()
            .filter(|address| !state.servers.contains_key(*address))
            .cloned()
            .collect();
        for address in added {
            let server = self.start_server(address.clone());
            state.servers.insert(address, server);
        }
    }

    /// Applies a new server description, publishing the resulting topology. Returns whether the
    /// topology description changed.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let mut state = self.broadcaster.clone_latest();
        let old_description = state.description.clone();

        if let Err(error) = state.description.update(sd) {
            tracing::warn!(address = %server_address, %error, "failed to apply server description");
            return false;
        }

        self.sync_servers(&mut state).await;

        let topology_changed = self.process_topology_diff(&old_description, &state.description);

        if topology_changed
            && (server_type.is_data_bearing()
                || (server_type != ServerType::Unknown
                    && state.description.topology_type() == TopologyType::Single))
        {
            if let Some(server) = state.servers.get(&server_address) {
                server.pool.mark_as_ready().await;
            }
        }

        let found_possible_primary = state.description.servers.iter().any(|(address, sd)| {
            sd.server_type == ServerType::PossiblePrimary
                && old_description
                    .get_server_description(address)
                    .map(|old| old.server_type != ServerType::PossiblePrimary)
                    .unwrap_or(true)
        });

        // Round trip times and write dates change on every heartbeat without changing the
        // description's identity, so the snapshot is republished regardless.
        self.broadcaster.publish_new_state(state);

        if found_possible_primary {
            self.update_requester.request();
        }

        topology_changed
    }

    /// Emits the events describing the transition between the two descriptions. Returns whether
    /// they differ.
    fn process_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = match old_description.diff(new_description) {
            Some(diff) => diff,
            None => return false,
        };

        for (address, (previous_description, new_description)) in diff.changed_servers {
            self.event_emitter.emit(|| {
                Box::new(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: ServerInfo::new_owned(previous_description.clone()),
                    new_description: ServerInfo::new_owned(new_description.clone()),
                })
                .into()
            });
        }

        for address in diff.removed_addresses {
            self.event_emitter.emit(|| {
                ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        for address in diff.added_addresses {
            self.event_emitter.emit(|| {
                ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        self.event_emitter.emit(|| {
            Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: old_description.clone(),
                new_description: new_description.clone(),
            })
            .into()
        });

        true
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        handshake: HandshakePhase,
    ) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        match &handshake {
            HandshakePhase::PreHello { generation } => {
                match (generation, server.pool.generation()) {
                    (PoolGeneration::Normal(hgen), PoolGeneration::Normal(sgen)) => {
                        if *hgen < sgen {
                            return false;
                        }
                    }
                    // Pre-hello handshake errors are ignored in load-balanced mode.
                    (PoolGeneration::LoadBalanced(_), PoolGeneration::LoadBalanced(_)) => {
                        return false
                    }
                    _ => {
                        tracing::warn!(
                            %address,
                            "load balanced mode mismatch between error and connection pool"
                        );
                        return false;
                    }
                }
            }
            HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => {
                if generation.is_stale(&server.pool.generation()) {
                    return false;
                }
            }
        }

        // Errors reporting a topology version no newer than the one already known describe a
        // state that has since been superseded.
        if let (Some(error_version), Some(current_version)) = (
            error.topology_version(),
            self.broadcaster
                .borrow_latest()
                .description
                .get_server_description(&address)
                .and_then(|sd| sd.topology_version()),
        ) {
            if !error_version.is_more_recent_than(current_version) {
                return false;
            }
        }

        let is_load_balanced =
            self.broadcaster.borrow_latest().description.topology_type() == TopologyType::LoadBalanced;
        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;

            if updated && (error.is_shutting_down() || handshake.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error, handshake.service_id()).await;
            }
            self.update_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (handshake.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;
            if updated {
                server.pool.clear(error, handshake.service_id()).await;
                // The monitor rechecks now rather than leaving the pool paused for a full
                // heartbeat.
                self.update_requester.request();
            }
            updated
        } else {
            false
        }
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    // The heartbeat monitor is disabled in load-balanced mode, so this will never
                    // have a service id.
                    server.pool.clear(error, None).await;
                }
                updated
            }
            None => false,
        }
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Sends updates to the topology worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    /// An updater that isn't attached to any topology. Every update is acknowledged as having
    /// changed nothing.
    #[cfg(test)]
    pub(crate) fn detached() -> TopologyUpdater {
        let (updater, mut receiver) = Self::channel();
        runtime::execute(async move {
            while let Some(message) = receiver.recv().await {
                message.acknowledge(false);
            }
        });
        updater
    }

    /// Sends the update and waits for the worker to process it. Returns whether the topology
    /// changed as a result, or false if the worker has stopped.
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }
}

/// Observes the snapshots published by the topology worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.receiver.borrow().servers.get(address).cloned()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Clones the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits for a state newer than the last one observed. Returns whether one was published
    /// before the timeout; a stopped worker also returns false.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        );
        self.receiver.borrow_and_update();
        changed
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        self.state_sender.send_replace(state);
    }
}

/// Broadcasts requests for an immediate check to every monitor.
#[derive(Clone, Debug)]
struct UpdateRequester {
    sender: broadcast::Sender<()>,
}

impl UpdateRequester {
    fn new() -> UpdateRequester {
        let (sender, _) = broadcast::channel(1);
        UpdateRequester { sender }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyUpdateRequestReceiver {
        TopologyUpdateRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyUpdateRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyUpdateRequestReceiver {
    /// Waits until a check is requested or the timeout elapses.
    pub(crate) async fn wait_for_update_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    pub(crate) fn clear_update_requests(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Enum describing a point in time during an operation's execution relative to when the
/// handshake for the connection being used in that operation completed.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening the
    /// socket).
    PreHello { generation: PoolGeneration },

    /// Describes a point in time after the initial hello has completed, but before the entire
    /// handshake (e.g. including authentication) completes.
    PostHello { generation: ConnectionGeneration },

    /// Describes a point in time after the handshake completed (e.g. when the command was sent to
    /// the server).
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &PooledConnection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // a handshaked connection always has a hello reply, so 0 should never actually be
            // returned here.
            max_wire_version: handshaked_connection.max_wire_version().unwrap_or(0),
        }
    }

    /// The `serviceId` reported by the server. If the initial hello has not completed, returns
    /// `None`.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            HandshakePhase::PreHello { .. } => None,
            HandshakePhase::PostHello { generation, .. } => generation.service_id(),
            HandshakePhase::AfterCompletion { generation, .. } => generation.service_id(),
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}
