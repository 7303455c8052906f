use tokio::sync::watch;

use super::worker::PoolGeneration;
use crate::error::Error;

/// What the worker publishes for readers outside of it.
#[derive(Clone, Debug)]
pub(super) struct PoolStatus {
    pub(super) generation: PoolGeneration,

    /// The pool-cleared error from the most recent clear, if the pool was ever cleared.
    pub(super) last_cleared: Option<Error>,

    /// Set while the pool is paused, to the error its check outs fail with.
    pub(super) paused: Option<Error>,
}

/// The worker publishes its status here so that pool handles and establishing tasks can read it
/// without a round trip.
pub(super) fn channel(
    initial: PoolGeneration,
    paused: Option<Error>,
) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(PoolStatus {
        generation: initial,
        last_cleared: None,
        paused,
    });
    (
        PoolGenerationPublisher(sender),
        PoolGenerationSubscriber(receiver),
    )
}

#[derive(Debug)]
pub(super) struct PoolGenerationPublisher(watch::Sender<PoolStatus>);

impl PoolGenerationPublisher {
    pub(super) fn publish(&self, update: impl FnOnce(&mut PoolStatus)) {
        // `send_modify` updates the value even when every subscriber is gone.
        self.0.send_modify(update);
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber(watch::Receiver<PoolStatus>);

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.0.borrow().generation.clone()
    }

    /// The error to fail a check out with when its connection was established in a generation
    /// that has since been cleared.
    pub(super) fn last_cleared(&self) -> Option<Error> {
        self.0.borrow().last_cleared.clone()
    }

    pub(super) fn paused(&self) -> Option<Error> {
        self.0.borrow().paused.clone()
    }
}
