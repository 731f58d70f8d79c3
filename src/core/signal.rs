//! Single-fire completion signal.
//!
//! Uses a `parking_lot` Condvar so waiters sleep until the signal fires or
//! their timeout elapses. No polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Completion signal shared between a task, its progress watcher, and joiners.
#[derive(Clone, Default)]
pub struct CompletionSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CompletionSignal {
    /// Create an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        let (fired, condvar) = self.inner.as_ref();
        let mut fired = fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        condvar.notify_all();
        true
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let (fired, condvar) = self.inner.as_ref();
        let mut fired = fired.lock();
        while !*fired {
            condvar.wait(&mut fired);
        }
    }

    /// Block until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` if the signal fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (fired, condvar) = self.inner.as_ref();
        let mut fired = fired.lock();
        while !*fired {
            if condvar.wait_until(&mut fired, deadline).timed_out() {
                return *fired;
            }
        }
        true
    }

    /// Wait for the signal from an async context.
    ///
    /// The Condvar wait runs on tokio's blocking pool.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self) {
        let signal = self.clone();
        if signal.is_fired() {
            return;
        }
        if let Err(e) = tokio::task::spawn_blocking(move || signal.wait()).await {
            tracing::error!(error = %e, "completion wait task failed");
        }
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}
