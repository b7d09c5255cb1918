//! Timers
//!
//! Timing utilities for request processing and image read statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stopwatch measuring time since creation or the last reset
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    /// Create and start a new stopwatch
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe accumulator of time spent in an operation
#[derive(Debug, Default)]
pub struct TimeAccumulator {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

impl TimeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a timed operation
    pub fn record(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Number of recorded operations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total recorded time
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }

    /// Time an operation and record it
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let stopwatch = Stopwatch::new();
        let result = f();
        self.record(stopwatch.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch() {
        let mut stopwatch = Stopwatch::new();
        std::thread::sleep(Duration::from_millis(10));
        assert!(stopwatch.elapsed() >= Duration::from_millis(10));

        stopwatch.reset();
        assert!(stopwatch.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_time_accumulator() {
        let accumulator = TimeAccumulator::new();

        for _ in 0..10 {
            accumulator.time(|| {
                std::thread::sleep(Duration::from_micros(100));
            });
        }

        assert_eq!(accumulator.count(), 10);
        assert!(accumulator.total() >= Duration::from_micros(1000));
    }
}
