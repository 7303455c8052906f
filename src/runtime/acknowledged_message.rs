use tokio::sync::oneshot;

/// A request sent to a worker along with a channel for the worker's reply. The requester learns
/// that the request was handled either from the reply or from the reply channel closing when the
/// message is dropped unanswered.
#[derive(Debug)]
pub(crate) struct AcknowledgedMessage<M, R = ()> {
    message: M,
    reply: Acknowledger<R>,
}

impl<M, R> AcknowledgedMessage<M, R> {
    pub(crate) fn package(message: M) -> (Self, AcknowledgmentReceiver<R>) {
        let (sender, receiver) = oneshot::channel();
        let message = Self {
            message,
            reply: Acknowledger(sender),
        };
        (message, AcknowledgmentReceiver(receiver))
    }

    /// Separates the request from its reply channel, so the request can be consumed before the
    /// reply is known.
    pub(crate) fn into_parts(self) -> (M, Acknowledger<R>) {
        (self.message, self.reply)
    }

    pub(crate) fn acknowledge(self, reply: impl Into<R>) {
        self.reply.acknowledge(reply);
    }
}

/// The reply half of an [`AcknowledgedMessage`].
#[derive(Debug)]
pub(crate) struct Acknowledger<R>(oneshot::Sender<R>);

impl<R> Acknowledger<R> {
    pub(crate) fn acknowledge(self, reply: impl Into<R>) {
        // The requester may have stopped waiting.
        let _ = self.0.send(reply.into());
    }
}

#[derive(Debug)]
pub(crate) struct AcknowledgmentReceiver<R>(oneshot::Receiver<R>);

impl<R> AcknowledgmentReceiver<R> {
    /// Resolves once the message is handled. `None` means it was dropped without a reply.
    pub(crate) async fn wait_for_acknowledgment(self) -> Option<R> {
        self.0.await.ok()
    }
}
