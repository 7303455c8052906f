//! Events published while monitoring a deployment and managing its connection pools.
//!
//! [`sdam`] events describe how the client's view of the deployment changes. [`cmap`] events
//! describe connection pool activity.

pub mod cmap;
pub mod sdam;

use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

type SyncHandler<T> = Arc<dyn Fn(T) + Sync + Send>;
type AsyncHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>;

/// Where published events are delivered.
///
/// A bounded `tokio` sender converts into a handler directly. Closures go through
/// [`EventHandler::callback`] or [`EventHandler::async_callback`]:
///
/// ```rust
/// # use mongodb_topology::{event::EventHandler, options::ClientOptions};
/// let options = ClientOptions::builder()
///     .sdam_event_handler(EventHandler::callback(|event| println!("{:?}", event)))
///     .build();
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// Called inline on the publishing task. Should return quickly.
    Callback(SyncHandler<T>),
    /// The returned future is spawned onto the runtime.
    AsyncCallback(AsyncHandler<T>),
    /// Events are sent from a spawned task, so a full channel never blocks the publisher.
    TokioMpsc(mpsc::Sender<T>),
}

impl<T> fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<mpsc::Sender<T>> for EventHandler<T> {
    fn from(sender: mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(sender)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Wraps a closure that is called with each event.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Wraps a closure whose returned future is spawned for each event.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(callback) => callback(event),
            Self::AsyncCallback(callback) => {
                crate::runtime::spawn(callback(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                crate::runtime::spawn(async move {
                    // A closed receiver just means nobody is listening anymore.
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}
