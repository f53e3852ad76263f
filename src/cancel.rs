//! One-shot cancellation signal shared by the calls of a dispatch cycle.
//!
//! The flag is set with a compare-and-swap so exactly one `cancel()` wins;
//! later triggers are no-ops. Once set it is never cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation token. Clones observe and trigger the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the token.
    ///
    /// Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        let won = self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the token has been triggered.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a trigger in between is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
