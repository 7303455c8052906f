use tokio::sync::mpsc;

/// Keeps a worker alive. The worker shuts down after every clone of its handle is dropped.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _alive: mpsc::Sender<()>,
}

impl WorkerHandle {
    #[cfg(test)]
    pub(crate) fn new_mocked() -> Self {
        WorkerHandleListener::channel().0
    }
}

/// The worker's side of its [`WorkerHandle`]s.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    alive: mpsc::Receiver<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (sender, receiver) = mpsc::channel(1);
        (
            WorkerHandle { _alive: sender },
            WorkerHandleListener { alive: receiver },
        )
    }

    /// Pends until no handles remain. Nothing is ever sent on the channel, so this only resolves
    /// once it closes. Meant to be one branch of a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        let _ = self.alive.recv().await;
    }
}
