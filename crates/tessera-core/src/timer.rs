//! CPU Timers
//!
//! Timing utilities for per-phase profiling.

use std::time::{Duration, Instant};

/// Timer holding a single begin/end sample
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseTimer {
    begin: Option<Instant>,
    last: Duration,
}

impl PhaseTimer {
    /// Create a timer with no sample
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new sample
    pub fn begin(&mut self) {
        self.begin = Some(Instant::now());
    }

    /// Finish the current sample
    pub fn end(&mut self) {
        if let Some(begin) = self.begin.take() {
            self.last = begin.elapsed();
        }
    }

    /// Duration of the last finished sample
    pub fn duration(&self) -> Duration {
        self.last
    }

    /// Last sample in seconds
    pub fn seconds(&self) -> f64 {
        self.last.as_secs_f64()
    }
}

/// Timer emitting a `timing` trace event with its duration when dropped
pub struct ScopedTimer {
    name: &'static str,
    start: Instant,
}

impl ScopedTimer {
    pub fn traced(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        tracing::debug!(
            target: "timing",
            name = self.name,
            duration_us = self.start.elapsed().as_micros() as u64,
            "{} finished",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer() {
        let mut timer = PhaseTimer::new();
        assert_eq!(timer.seconds(), 0.0);

        timer.begin();
        std::thread::sleep(Duration::from_millis(5));
        timer.end();
        assert!(timer.duration() >= Duration::from_millis(5));
        assert!(timer.seconds() >= 0.005);

        // A new sample replaces the last one only when it ends
        timer.begin();
        assert!(timer.duration() >= Duration::from_millis(5));
    }

    #[test]
    fn test_phase_timer_end_without_begin() {
        let mut timer = PhaseTimer::new();
        timer.end();
        assert_eq!(timer.duration(), Duration::ZERO);
    }

    #[test]
    fn test_scoped_timer_starts_on_creation() {
        let before = Instant::now();
        let timer = ScopedTimer::traced("load_scene");
        assert_eq!(timer.name, "load_scene");
        assert!(timer.start >= before);
        drop(timer);
    }
}
