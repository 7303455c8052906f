use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

use super::{
    description::server::ServerDescription,
    topology::{TopologyUpdateRequestReceiver, TopologyUpdater, TopologyWatcher},
    TopologyVersion,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime::{self, AsyncJoinHandle},
};

/// Weight given to each new sample in the moving average of round trip times.
const RTT_SMOOTHING_FACTOR: f64 = 0.2;

/// Handle to a running monitor task. Dropping it cancels the task, including any check in flight.
#[derive(Debug)]
pub(crate) struct MonitorHandle {
    handle: AsyncJoinHandle<()>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    next_connection_id: u32,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    update_request_receiver: TopologyUpdateRequestReceiver,
    sdam_event_emitter: SdamEventEmitter,
    client_options: ClientOptions,

    /// The most recent topology version reported by the server. While this is set, the server
    /// supports streaming and checks are awaitable.
    topology_version: Option<TopologyVersion>,

    rtt_info: RttInfoHandle,

    /// Measures round trip times while streaming, since awaited checks can't be timed.
    rtt_monitor: Option<MonitorHandle>,
}

impl Monitor {
    /// Starts monitoring the server at `address`, returning a handle that stops the monitor when
    /// dropped.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        update_request_receiver: TopologyUpdateRequestReceiver,
        sdam_event_emitter: SdamEventEmitter,
        client_options: ClientOptions,
        connection_establisher: ConnectionEstablisher,
    ) -> MonitorHandle {
        let monitor = Self {
            address,
            connection: None,
            next_connection_id: 1,
            connection_establisher,
            topology_updater,
            topology_watcher,
            update_request_receiver,
            sdam_event_emitter,
            client_options,
            topology_version: None,
            rtt_info: RttInfoHandle::new(),
            rtt_monitor: None,
        };

        MonitorHandle {
            handle: runtime::spawn(monitor.execute()),
        }
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.client_options.heartbeat_frequency();
        let min_frequency = self.client_options.min_heartbeat_frequency();

        while self.topology_watcher.is_alive() {
            let check_succeeded = self.check_server().await;

            // In the streaming protocol the server replies as soon as something changes or
            // the await time elapses, so the next check starts right away.
            if check_succeeded && self.topology_version.is_some() {
                self.ensure_rtt_monitor_started();
                continue;
            }

            // Requests made while the check ran are satisfied by it.
            self.update_request_receiver.clear_update_requests();
            runtime::delay_for(min_frequency).await;
            self.update_request_receiver
                .wait_for_update_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }
    }

    /// Checks the server by running a hello command. If a network error occurs against a server
    /// that was previously known, the check is retried once on a fresh connection.
    ///
    /// Returns whether the check succeeded.
    async fn check_server(&mut self) -> bool {
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description = self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.rtt_info.average().unwrap_or_default(),
                );
                self.topology_updater.update(server_description).await;
                true
            }
            Err(e) => {
                self.handle_error(e).await;
                false
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let awaited = self.topology_version.is_some();
        let driver_connection_id = self
            .connection
            .as_ref()
            .map(|c| c.id)
            .unwrap_or(self.next_connection_id);
        let server_connection_id = self
            .connection
            .as_ref()
            .and_then(|c| c.server_connection_id());

        self.sdam_event_emitter.emit(|| {
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
                driver_connection_id,
                server_connection_id,
            }
            .into()
        });

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let heartbeat_frequency = self.client_options.heartbeat_frequency();
                let awaitable_options =
                    self.topology_version
                        .map(|topology_version| AwaitableHelloOptions {
                            topology_version,
                            max_await_time: heartbeat_frequency,
                        });
                let hello_ok = conn
                    .hello_reply
                    .as_ref()
                    .and_then(|reply| reply.command_response.hello_ok);
                let command = hello_command(
                    self.client_options.server_api.as_ref(),
                    self.client_options.load_balanced,
                    Some(hello_ok.unwrap_or(false)),
                    awaitable_options,
                );

                // An awaited check may legitimately take up to the await time before the server
                // replies.
                let timeout = if awaited {
                    heartbeat_frequency.saturating_add(self.client_options.connect_timeout())
                } else {
                    self.client_options.connect_timeout()
                };
                let timeout = if timeout.is_zero() {
                    Duration::MAX
                } else {
                    timeout
                };

                runtime::timeout(timeout, run_hello(conn, command))
                    .await
                    .and_then(|result| result)
            }
            None => {
                let id = self.next_connection_id;
                self.next_connection_id += 1;
                self.connection_establisher
                    .establish_monitoring_connection(self.address.clone(), id)
                    .await
                    .map(|(connection, reply)| {
                        self.connection = Some(connection);
                        reply
                    })
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                if !awaited {
                    self.rtt_info.add_sample(duration);
                }
                self.topology_version = reply.command_response.topology_version;

                let server_connection_id = reply.command_response.connection_id;
                self.sdam_event_emitter.emit(|| {
                    ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                        server_connection_id,
                    }
                    .into()
                });
            }
            Err(ref e) => {
                self.connection.take();
                self.sdam_event_emitter.emit(|| {
                    ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                        server_connection_id,
                    }
                    .into()
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) {
        tracing::debug!(address = %self.address, %error, "server check failed");
        self.topology_version.take();
        self.rtt_info.reset();
        self.rtt_monitor.take();
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await;
    }

    fn ensure_rtt_monitor_started(&mut self) {
        if self.rtt_monitor.is_some() {
            return;
        }

        let rtt_monitor = RttMonitor {
            address: self.address.clone(),
            connection: None,
            connection_establisher: self.connection_establisher.clone(),
            client_options: self.client_options.clone(),
            rtt_info: self.rtt_info.clone(),
        };
        self.rtt_monitor = Some(MonitorHandle {
            handle: runtime::spawn(rtt_monitor.execute()),
        });
    }
}

/// Monitor that periodically measures the round trip time to a server on its own connection.
/// Only runs while the server is being checked with the streaming protocol.
struct RttMonitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    client_options: ClientOptions,
    rtt_info: RttInfoHandle,
}

impl RttMonitor {
    async fn execute(mut self) {
        let heartbeat_frequency = self.client_options.heartbeat_frequency();

        loop {
            let start = Instant::now();
            match self.perform_hello().await {
                Ok(()) => self.rtt_info.add_sample(start.elapsed()),
                // The heartbeat monitor reports errors; a broken connection is simply replaced
                // on the next attempt.
                Err(_) => {
                    self.connection.take();
                }
            }

            runtime::delay_for(heartbeat_frequency).await;
        }
    }

    async fn perform_hello(&mut self) -> Result<()> {
        match self.connection {
            Some(ref mut conn) => {
                let hello_ok = conn
                    .hello_reply
                    .as_ref()
                    .and_then(|reply| reply.command_response.hello_ok);
                let command = hello_command(
                    self.client_options.server_api.as_ref(),
                    self.client_options.load_balanced,
                    Some(hello_ok.unwrap_or(false)),
                    None,
                );
                run_hello(conn, command).await?;
            }
            None => {
                let (connection, _) = self
                    .connection_establisher
                    .establish_monitoring_connection(self.address.clone(), 0)
                    .await?;
                self.connection = Some(connection);
            }
        }
        Ok(())
    }
}

/// An exponentially weighted moving average of round trip times.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct RttInfo {
    pub(crate) average: Option<Duration>,
}

impl RttInfo {
    pub(crate) fn add_sample(&mut self, sample: Duration) {
        match self.average {
            Some(old_rtt) => {
                let new_rtt = RTT_SMOOTHING_FACTOR * sample.as_secs_f64()
                    + (1.0 - RTT_SMOOTHING_FACTOR) * old_rtt.as_secs_f64();
                self.average = Some(Duration::from_secs_f64(new_rtt.max(0.0)));
            }
            None => self.average = Some(sample),
        }
    }
}

/// Shared handle to the round trip time average of a server, written to by both of its
/// monitors.
#[derive(Clone, Debug)]
struct RttInfoHandle {
    sender: Arc<watch::Sender<RttInfo>>,
}

impl RttInfoHandle {
    fn new() -> Self {
        let (sender, _) = watch::channel(RttInfo::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    fn add_sample(&self, sample: Duration) {
        self.sender.send_modify(|info| info.add_sample(sample));
    }

    fn average(&self) -> Option<Duration> {
        self.sender.borrow().average
    }

    fn reset(&self) {
        self.sender.send_modify(|info| info.average = None);
    }
}
