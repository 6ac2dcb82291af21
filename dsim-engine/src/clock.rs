use std::sync::atomic::{AtomicI64, Ordering};

/// Per-process Lamport clock stamped into `Header::logical_clock`.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicI64);

impl LogicalClock {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    #[must_use]
    pub fn now(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advances for a local send and returns the stamp.
    pub fn tick(&self) -> i64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Merges a received stamp: `max(local, remote) + 1`.
    pub fn merge(&self, remote: Option<i64>) -> i64 {
        let remote = remote.unwrap_or(0);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = current.max(remote) + 1;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_and_merge() {
        let clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.merge(Some(10)), 11);
        assert_eq!(clock.merge(Some(3)), 12);
        assert_eq!(clock.merge(None), 13);
        assert_eq!(clock.now(), 13);
    }
}
