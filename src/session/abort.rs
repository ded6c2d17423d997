//! Cooperative abort flag shared by a session's checks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Once set, no new render submissions or match retries start. Work already
/// on the wire is left to finish.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.state.aborted.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Resolve once the signal is aborted
    pub async fn aborted(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, waking early on abort.
    ///
    /// Returns `false` when the sleep was cut short by an abort.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_aborted() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_aborted(),
            _ = notified => false,
        }
    }
}
