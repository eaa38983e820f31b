use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::interface::lock;

/// Interruptible sleep. Once cancelled, every current and future `sleep`
/// returns immediately.
#[derive(Debug, Default)]
pub struct Sleeper {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `duration`. Returns `true` if woken by [`Sleeper::cancel`].
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = lock(&self.cancelled);
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            cancelled = self
                .wakeup
                .wait_timeout(cancelled, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    pub fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }
}
