use tokio::sync::{mpsc, oneshot};

use super::conn::pooled::PooledConnection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

type ReplySender = oneshot::Sender<ConnectionRequestResult>;

pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver(receiver),
    )
}

/// Asks a pool's worker for connections. The worker keeps running for as long as any requester
/// exists. Once the last one is dropped it closes its available connections and exits.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<ReplySender>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    pub(super) async fn request(&self) -> ConnectionRequestResult {
        let (reply, receiver) = oneshot::channel();
        if self.sender.send(reply).is_err() {
            return ConnectionRequestResult::PoolClosed;
        }
        // The worker drops pending replies when it stops.
        receiver
            .await
            .unwrap_or(ConnectionRequestResult::PoolClosed)
    }
}

#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver(mpsc::UnboundedReceiver<ReplySender>);

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        let reply = self.0.recv().await?;
        Some(ConnectionRequest { reply })
    }
}

/// A check out waiting for the worker's answer.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    reply: ReplySender,
}

impl ConnectionRequest {
    /// Answers the request. Hands `result` back if the requester is no longer waiting.
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.reply.send(result)
    }

    /// The requester gave up, usually because its deadline passed.
    pub(super) fn is_closed(&self) -> bool {
        self.reply.is_closed()
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// An idle connection taken from the available set.
    Pooled(Box<PooledConnection>),

    /// A connection being opened for this request. Await the handle for it.
    Establishing(AsyncJoinHandle<Result<PooledConnection>>),

    /// The pool is paused. Carries the error that paused it.
    PoolCleared(Error),

    PoolClosed,
}
