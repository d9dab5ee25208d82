//! Cooperative stop signal shared by a chain runtime's loops

use std::time::Duration;
use tokio::sync::watch;

/// Broadcast cancellation token.
///
/// Cloning shares the same underlying signal; `stop()` is idempotent.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Trigger the signal. Later calls are no-ops.
    pub fn stop(&self) {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been triggered
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // Sender is held by self, so wait_for can only fail if it is dropped
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless stopped first.
    ///
    /// Returns `true` if the sleep completed, `false` if the signal fired.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => false,
            _ = tokio::time::sleep(duration) => true,
        }
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

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());

        signal.stop();
        signal.stop();
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_clones_observe_stop() {
        let signal = StopSignal::new();
        let clone = signal.clone();

        let waiter = tokio::spawn(async move { clone.stopped().await });
        signal.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_stop() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clone.stop();
        });

        let completed = signal.sleep(Duration::from_secs(30)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_sleep_completes_without_stop() {
        let signal = StopSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_when_already_stopped() {
        let signal = StopSignal::new();
        signal.stop();
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .expect("already stopped");
    }
}
