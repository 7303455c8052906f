use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crate::{cmap::ConnectionPool, options::ServerAddress};

/// A server the topology currently tracks, along with its pool and in-flight operation count.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    pub(crate) pool: ConnectionPool,

    in_flight: AtomicU32,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, pool: ConnectionPool) -> Arc<Self> {
        Arc::new(Self {
            address,
            pool,
            in_flight: AtomicU32::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress, in_flight: u32) -> Self {
        Self {
            pool: ConnectionPool::new_mocked(address.clone()),
            address,
            in_flight: AtomicU32::new(in_flight),
        }
    }

    pub(crate) fn begin_operation(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_operation(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Operations currently holding a [`SelectedServer`](super::SelectedServer) for this server.
    pub(crate) fn operation_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}
