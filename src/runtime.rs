mod acknowledged_message;
mod join_handle;
mod worker_handle;

use std::{future::Future, time::Duration};

use tokio::time::{Interval, MissedTickBehavior};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::Result;

/// Runs `fut` on the current tokio runtime. Panics outside of one.
pub(crate) fn spawn<F>(fut: F) -> AsyncJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Like [`spawn`], for tasks nobody joins.
pub(crate) fn execute<F>(fut: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    drop(spawn(fut));
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// Fails with an I/O `TimedOut` error if `future` does not finish within `limit`.
pub(crate) async fn timeout<F: Future>(limit: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_elapsed| std::io::ErrorKind::TimedOut.into())
}

/// A ticker that waits a full `period` after a late tick instead of bursting to catch up.
pub(crate) fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
