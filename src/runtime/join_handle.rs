use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::JoinHandle;

/// A spawned task. Awaiting it yields the task's output, re-raising the task's panic if it had
/// one.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(JoinHandle<T>);

impl<T: Send + 'static> AsyncJoinHandle<T> {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::spawn(fut))
    }
}

impl<T> AsyncJoinHandle<T> {
    /// Cancels the task. The handle must not be awaited afterwards.
    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(output)) => Poll::Ready(output),
            Poll::Ready(Err(error)) => std::panic::resume_unwind(error.into_panic()),
        }
    }
}
