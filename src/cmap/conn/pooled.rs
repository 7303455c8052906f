use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use derive_where::derive_where;

use super::{CmapEventEmitter, Connection, ConnectionGeneration, PendingConnection};
use crate::{
    cmap::{manager::PoolManager, PoolGeneration},
    event::cmap::{
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionReadyEvent,
    },
    sdam::SelectedServer,
    transport::CommandStream,
};

/// A [`Connection`] owned by a pool. Derefs to the underlying [`Connection`].
///
/// Dropping a checked-out `PooledConnection` returns it to its pool.
#[derive_where(Debug)]
pub struct PooledConnection {
    connection: Connection,

    /// The pool generation the connection was established in.
    pub(crate) generation: ConnectionGeneration,

    state: PoolState,

    /// Held while checked out so that the server's operation count covers the connection's use.
    pub(crate) selected_server: Option<SelectedServer>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

/// Where a connection stands relative to its pool.
#[derive(Debug)]
enum PoolState {
    /// Being established, or already closed by the pool.
    Detached,

    /// In the pool's available set since the given instant.
    Available(Instant),

    /// Owned by a caller. The manager takes the connection back when it is dropped.
    CheckedOut(PoolManager),
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl PooledConnection {
    pub(crate) fn new(pending_connection: PendingConnection, stream: Box<dyn CommandStream>) -> Self {
        let generation = match pending_connection.generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            // The service id is only known once the handshake reply arrives.
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };
        Self {
            connection: Connection::new(
                pending_connection.address,
                stream,
                pending_connection.id,
                pending_connection.time_created,
            ),
            generation,
            state: PoolState::Detached,
            selected_server: None,
            event_emitter: pending_connection.event_emitter,
        }
    }

    pub(crate) fn mark_as_available(&mut self) {
        self.selected_server.take();
        self.state = PoolState::Available(Instant::now());
    }

    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.state = PoolState::CheckedOut(manager);
    }

    /// Whether the connection has sat in the available set for at least `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (&self.state, max_idle_time) {
            (PoolState::Available(since), Some(max_idle_time)) => since.elapsed() >= max_idle_time,
            _ => false,
        }
    }

    /// Whether this connection belongs to a generation the pool has since cleared.
    pub(crate) fn is_stale(&self, current_generation: &PoolGeneration) -> bool {
        self.generation.is_stale(current_generation)
    }

    /// Moves the connection out of `self`, leaving a detached shell behind.
    fn take(&mut self) -> Self {
        Self {
            connection: self.connection.take(),
            generation: self.generation,
            state: PoolState::Detached,
            selected_server: None,
            event_emitter: self.event_emitter.clone(),
        }
    }

    /// Closes the connection, emitting a [`ConnectionClosedEvent`] with `reason`.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.state = PoolState::Detached;
        self.event_emitter
            .emit_event(|| self.closed_event(reason).into());
    }

    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: time_started.elapsed(),
        }
    }

    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
        }
    }

    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: self.connection.time_created.elapsed(),
        }
    }

    pub(crate) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            reason,
            error: self.connection.error.clone(),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Only a checked-out connection goes back to the pool. Available and detached
        // connections are owned by the pool worker, which has already accounted for them.
        if let PoolState::CheckedOut(manager) =
            std::mem::replace(&mut self.state, PoolState::Detached)
        {
            let dropped_connection = self.take();
            if let Err(mut conn) = manager.check_in(dropped_connection) {
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}
