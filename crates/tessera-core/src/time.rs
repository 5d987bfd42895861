//! Time Sources
//!
//! Clock abstraction used for timeout bookkeeping:
//! - Monotonic wall clock for production use
//! - Manually advanced clock for deterministic tests and replays

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of timestamps in seconds
pub trait Clock: Send + Sync {
    /// Current time in seconds since an arbitrary fixed origin
    fn now_secs(&self) -> f64;
}

/// Monotonic clock measuring from its creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by the given number of seconds
    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs.max(0.0)));
    }

    /// Advance the clock by a duration
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Set the absolute time in seconds
    pub fn set_secs(&self, secs: f64) {
        self.nanos.store(
            Duration::from_secs_f64(secs.max(0.0)).as_nanos() as u64,
            Ordering::Relaxed,
        );
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        self.nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_secs(&self) -> f64 {
        (**self).now_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let t1 = clock.now_secs();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now_secs();

        assert!(t2 > t1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_secs(), 0.0);

        clock.advance_secs(1.5);
        assert!((clock.now_secs() - 1.5).abs() < 1e-9);

        clock.set_secs(10.0);
        assert!((clock.now_secs() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_shared_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let shared: Arc<dyn Clock> = clock.clone();

        clock.advance_secs(0.25);
        assert!((shared.now_secs() - 0.25).abs() < 1e-9);
    }
}
