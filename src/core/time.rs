//! Elapsed-time measurement
//!
//! [`Stopwatch`] is built on `tokio::time::Instant` so that measurements
//! follow the runtime clock, including paused time in tests.

use std::time::Duration;
use tokio::time::Instant;

/// Measures wall time since it was started
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started_at: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    /// Stopwatch measuring from an earlier instant
    pub fn since(started_at: Instant) -> Self {
        Self { started_at }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Elapsed seconds, for log lines
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}
