use tokio::sync::watch;

/// Transmitter side of a shutdown signal for background tasks.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals every subscriber to stop. Safe to call without receivers.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    /// Creates a new receiver observing this channel.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested or the transmitter was dropped.
    pub async fn wait(&mut self) {
        // A dropped sender means nobody can ever resume the task.
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

/// Creates a new shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
