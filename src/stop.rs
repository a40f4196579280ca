//! Cooperative stop flag shared by the dispatcher, discoverer and workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A cloneable, one-way stop flag.
///
/// Nothing is ever interrupted: holders poll [`StopSignal::is_stopped`] at loop
/// tops and before navigations, and use [`StopSignal::sleep`] for waits so a
/// pending stop cuts the wait short.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = rx.wait_for(|stopped| *stopped) => false,
        }
    }
}
