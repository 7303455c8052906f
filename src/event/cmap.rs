//! Contains the events and functionality for monitoring the behavior of the connection pooling of
//! a topology.

use std::time::Duration;

use bson::oid::ObjectId;
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{error::Error, options::ServerAddress, trace::connection::ConnectionTracingEventEmitter};

use super::EventHandler;

pub use crate::cmap::options::ConnectionPoolOptions;

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// If the topology is load balanced, the id of the service whose connections were cleared.
    pub service_id: Option<ObjectId>,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection, scoped to its pool.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used. This indicates that all the necessary
/// prerequisites for using a connection (handshake, authentication, etc.) have been completed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection, scoped to its pool.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    #[serde(default = "Duration::default")]
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection, scoped to its pool.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that caused the connection to close, if any.
    #[serde(skip)]
    pub error: Option<Error>,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped during an operation.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the checkout to fail.
    #[serde(skip)]
    pub error: Option<Error>,

    /// How long the checkout was attempted for before failing.
    #[serde(default = "Duration::default")]
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The deadline or wait queue timeout elapsed before a connection became available.
    Timeout,

    /// An error occurred while trying to establish a connection, or the pool was paused.
    ConnectionError,

    /// The pool was closed.
    PoolClosed,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection, scoped to its pool.
    pub connection_id: u32,

    /// How long the checkout took.
    #[serde(default = "Duration::default")]
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection, scoped to its pool.
    pub connection_id: u32,
}

/// The events published by connection pools.
#[derive(Clone, Debug, From)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

/// Sends CMAP events to the tracing emitter and to the user's handler, if one was configured.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    user_handler: Option<EventHandler<CmapEvent>>,
    tracing_emitter: ConnectionTracingEventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<CmapEvent>>,
        topology_id: ObjectId,
    ) -> CmapEventEmitter {
        Self {
            user_handler,
            tracing_emitter: ConnectionTracingEventEmitter::new(topology_id),
        }
    }

    /// Emits the event built by `generate_event`. The closure is only invoked if someone is
    /// listening.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CmapEvent) {
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
