use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Notify;

use crate::{event::EventHandler, runtime};

/// A buffer of events that provides utility methods for querying the buffer and awaiting new event
/// arrival.
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T> {
    inner: Arc<EventBufferInner<T>>,
}

#[derive(Debug)]
struct EventBufferInner<T> {
    events: Mutex<Vec<T>>,
    event_received: Notify,
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventBufferInner {
                events: Mutex::new(Vec::new()),
                event_received: Notify::new(),
            }),
        }
    }

    /// A handler that records every event it receives into this buffer.
    pub(crate) fn handler(&self) -> EventHandler<T> {
        let inner = self.inner.clone();
        EventHandler::callback(move |event| {
            inner.events.lock().unwrap().push(event);
            inner.event_received.notify_waiters();
        })
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.inner.events.lock().unwrap().clone()
    }

    pub(crate) fn filter_map<R>(&self, f: impl Fn(&T) -> Option<R>) -> Vec<R> {
        self.inner.events.lock().unwrap().iter().filter_map(f).collect()
    }

    pub(crate) fn count(&self, f: impl Fn(&T) -> bool) -> usize {
        self.inner.events.lock().unwrap().iter().filter(|e| f(e)).count()
    }

    pub(crate) fn clear(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    /// Waits until at least `n` buffered events match `f`, returning false if that doesn't
    /// happen within `timeout`.
    pub(crate) async fn wait_for_count(
        &self,
        timeout: Duration,
        n: usize,
        f: impl Fn(&T) -> bool,
    ) -> bool {
        runtime::timeout(timeout, async {
            loop {
                // Created before checking so that an event pushed in between isn't missed.
                let notified = self.inner.event_received.notified();
                if self.count(&f) >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Waits for an event matching `f` and returns the first one.
    pub(crate) async fn wait_for(&self, timeout: Duration, f: impl Fn(&T) -> bool) -> Option<T> {
        if !self.wait_for_count(timeout, 1, &f).await {
            return None;
        }
        self.inner
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|e| f(e))
            .cloned()
    }
}
