//! Cooperative stop signal shared by every session task

use std::sync::Arc;
use tokio::sync::watch;

/// Set once, observed by all clones. Loops poll [`StopSignal::is_stopped`]
/// between bounded waits, async code can also await [`StopSignal::stopped`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown; idempotent
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal is set
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // Sender lives inside self, so wait_for only fails if it was dropped
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_is_seen_by_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_stopped());

        let waiter = tokio::spawn(async move { clone.stopped().await });
        signal.stop();
        signal.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_stopped());
    }
}
