use tokio::sync::watch;

/// Requests cooperative cancellation of a run.
///
/// The reason of the first request wins; later requests are ignored.
#[derive(Debug, Clone)]
pub struct CancelTx(watch::Sender<Option<String>>);

impl CancelTx {
    /// Requests cancellation. Returns `false` when the run was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Creates a new receiver observing this channel.
    pub fn subscribe(&self) -> CancelRx {
        CancelRx(self.0.subscribe())
    }
}

/// Observes cancellation requests at suspension points.
#[derive(Debug, Clone)]
pub struct CancelRx(watch::Receiver<Option<String>>);

impl CancelRx {
    pub fn is_cancelled(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.0.borrow().clone()
    }

    /// Resolves when cancellation is requested. Never resolves if the sender is dropped first.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a new cancel channel in the running state.
pub fn create_cancel_channel() -> (CancelTx, CancelRx) {
    let (tx, rx) = watch::channel(None);
    (CancelTx(tx), CancelRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_wins() {
        let (tx, mut rx) = create_cancel_channel();
        assert!(!rx.is_cancelled());

        assert!(tx.cancel("user request"));
        assert!(!tx.cancel("second request"));

        rx.cancelled().await;
        assert_eq!(rx.reason().as_deref(), Some("user request"));
    }
}
