//! Events describing how the topology's view of the deployment changes, and the heartbeats
//! behind those changes.

use std::time::Duration;

use bson::{oid::ObjectId, Document};
use derive_more::From;

use crate::{error::Error, options::ServerAddress, trace::topology::TopologyTracingEventEmitter};

use super::EventHandler;

pub use crate::sdam::{TopologyDescription, TopologyType};

/// A server description as carried by events.
pub type ServerDescription = crate::sdam::public::ServerInfo<'static>;

/// Published when a heartbeat or an error changes what is known about a server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// What was known before the change.
    pub previous_description: ServerDescription,

    /// What is known now.
    pub new_description: ServerDescription,
}

impl ServerDescriptionChangedEvent {
    #[cfg(test)]
    pub(crate) fn marks_server_unknown(&self) -> bool {
        self.previous_description.server_type().is_available()
            && self.new_description.server_type() == crate::sdam::ServerType::Unknown
    }
}

/// Published when a server joins the topology and starts being monitored.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server leaves the topology or the topology shuts down.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published whenever a new topology description differs from the previous one.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The description before the change.
    pub previous_description: TopologyDescription,

    /// The description after the change.
    pub new_description: TopologyDescription,
}

/// Published once, when a topology is created.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed, either explicitly or because every handle to it was
/// dropped.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published before a monitor sends a heartbeat.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was a streaming (awaitable) check.
    pub awaited: bool,

    /// The monitor's local id for its connection.
    pub driver_connection_id: u32,

    /// The id the server reported for the connection. Absent for the first heartbeat on a new
    /// monitoring connection.
    pub server_connection_id: Option<i64>,
}

/// Published when a heartbeat gets a reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// How long the heartbeat took. For awaited heartbeats this includes the time the server
    /// held the request.
    pub duration: Duration,

    /// The raw reply.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was a streaming (awaitable) check.
    pub awaited: bool,

    /// The monitor's local id for its connection.
    pub driver_connection_id: u32,

    /// The id the server reported for the connection, if any.
    pub server_connection_id: Option<i64>,
}

/// Published when a heartbeat fails, whether to connect, to send or to parse the reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// How long the heartbeat took. For awaited heartbeats this includes the time the server
    /// held the request.
    pub duration: Duration,

    /// Why the heartbeat failed.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was a streaming (awaitable) check.
    pub awaited: bool,

    /// The monitor's local id for its connection.
    pub driver_connection_id: u32,

    /// The id the server reported for the connection, if any.
    pub server_connection_id: Option<i64>,
}

/// The events published by topology monitoring.
#[derive(Clone, Debug, From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Sends SDAM events to the tracing emitter and to the user's handler, if one was configured.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    user_handler: Option<EventHandler<SdamEvent>>,
    tracing_emitter: TopologyTracingEventEmitter,
}

impl SdamEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<SdamEvent>>,
        topology_id: ObjectId,
    ) -> Self {
        Self {
            user_handler,
            tracing_emitter: TopologyTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit(&self, generate_event: impl FnOnce() -> SdamEvent) {
        let tracing_enabled = self.tracing_emitter.enabled();
        if self.user_handler.is_none() && !tracing_enabled {
            return;
        }

        let event = generate_event();
        if tracing_enabled {
            self.tracing_emitter.handle(event.clone());
        }
        if let Some(ref handler) = self.user_handler {
            handler.handle(event);
        }
    }
}
