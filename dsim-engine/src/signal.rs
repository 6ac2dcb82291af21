//! Single-slot release signal.
//!
//! A waiter blocks until the controller calls [`ReleaseSignal::release`]. A
//! successful wait consumes the release, so each release lets exactly one wait
//! through. Releases do not accumulate: releasing twice before anyone waits
//! still admits a single wait.

use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
pub struct ReleaseSignal {
    released: Mutex<bool>,
    cond: Condvar,
}

impl ReleaseSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the slot and wakes one waiter.
    pub fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        *released = true;
        self.cond.notify_one();
    }

    /// Clears a pending release without waking anyone.
    pub fn reset(&self) {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until released, then consumes the release.
    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *released = false;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` when a release was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            released = self
                .cond
                .wait_timeout(released, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *released = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_release_admits_one_wait() {
        let signal = ReleaseSignal::new();
        signal.release();
        signal.release();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        // Second release collapsed into the first
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_reset_discards_pending_release() {
        let signal = ReleaseSignal::new();
        signal.release();
        signal.reset();
        assert!(!signal.is_released());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_blocks_until_released_from_other_thread() {
        let signal = Arc::new(ReleaseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        signal.release();
        waiter.join().unwrap();
        assert!(!signal.is_released());
    }
}
