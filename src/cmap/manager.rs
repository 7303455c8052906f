use bson::oid::ObjectId;
use tokio::sync::mpsc;

use super::conn::pooled::PooledConnection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (PoolManager { sender }, ManagementRequestReceiver(receiver))
}

/// Sends state changes and returned connections to a pool's worker.
///
/// Unlike a [`ConnectionRequester`](super::connection_requester::ConnectionRequester), holding a
/// manager does not keep the worker running.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Sends the request built by `request` and waits for the worker to handle it. Returns
    /// `None` when the worker is already gone.
    fn send_acknowledged(
        &self,
        request: impl FnOnce(AcknowledgedMessage<()>) -> PoolManagementRequest,
    ) -> Option<AcknowledgmentReceiver<()>> {
        let (done, receiver) = AcknowledgedMessage::package(());
        self.sender.send(request(done)).ok().map(|()| receiver)
    }

    /// Pauses the pool (or, when load balanced, invalidates the connections to one service).
    pub(super) async fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        let sent = self.send_acknowledged(|done| PoolManagementRequest::Clear {
            done,
            cause,
            service_id,
        });
        if let Some(receiver) = sent {
            receiver.wait_for_acknowledgment().await;
        }
    }

    pub(super) async fn mark_as_ready(&self) {
        let sent = self.send_acknowledged(|done| PoolManagementRequest::MarkAsReady { done });
        if let Some(receiver) = sent {
            receiver.wait_for_acknowledgment().await;
        }
    }

    /// Asks the worker to shut down. The returned receiver resolves once the available
    /// connections are closed and every waiter has been failed.
    pub(super) fn close(&self) -> Option<AcknowledgmentReceiver<()>> {
        self.send_acknowledged(|done| PoolManagementRequest::Close { done })
    }

    /// Returns a checked-out connection. Hands the connection back if the worker is gone.
    pub(crate) fn check_in(&self, connection: PooledConnection) -> Result<(), PooledConnection> {
        match self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(PoolManagementRequest::CheckIn(connection))) => {
                Err(*connection)
            }
            Err(_) => Ok(()),
        }
    }

    pub(super) fn handle_connection_failed(&self) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionFailed);
    }

    pub(super) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver(mpsc::UnboundedReceiver<PoolManagementRequest>);

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.0.recv().await
    }
}

/// A request to the pool worker. Requests carrying `done` are acknowledged when the worker
/// drops them after handling.
#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    Clear {
        done: AcknowledgedMessage<()>,
        cause: Error,
        service_id: Option<ObjectId>,
    },

    MarkAsReady {
        done: AcknowledgedMessage<()>,
    },

    Close {
        done: AcknowledgedMessage<()>,
    },

    CheckIn(Box<PooledConnection>),

    /// An establishment started by the worker failed.
    HandleConnectionFailed,

    HandleConnectionSucceeded(ConnectionSucceeded),
}

/// The outcome of a successful establishment.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// Opened to satisfy `min_pool_size`. Joins the available set.
    ForPool(Box<PooledConnection>),

    /// Opened for a check out and already handed to its requester.
    Used,

    /// Opened for a check out, but the pool was cleared meanwhile. Closed as stale.
    Superseded(Box<PooledConnection>),
}
