use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Logging context of one simulation run.
///
/// Created when the network is activated, shared with every process and
/// dropped at teardown.
#[derive(Debug)]
pub struct RunLog {
    run: u64,
    started: Instant,
    steps: AtomicU64,
    messages_sent: AtomicU64,
}

impl RunLog {
    #[must_use]
    pub fn new(run: u64) -> Self {
        Self {
            run,
            started: Instant::now(),
            steps: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn run(&self) -> u64 {
        self.run
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Counts a delivered message; returns the run-wide step number.
    pub fn record_step(&self) -> u64 {
        self.steps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_send(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}
