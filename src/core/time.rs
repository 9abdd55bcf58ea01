//! Injectable clocks.
//!
//! The aggregation driver never reads OS time directly; it asks a
//! [`TimeProvider`] so tests and simulations can run on synthetic time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock timestamps.
pub trait TimeProvider: Send + Sync {
    /// Monotonic time used for frame deltas and submission intervals.
    fn now(&self) -> Instant;

    /// Wall-clock time used for the reported time period.
    fn system_now(&self) -> SystemTime;
}

/// Reads the real clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeProvider for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Deterministic clock: every call advances its own timeline by a fixed tick.
///
/// Monotonic time starts at the instant the clock was created, wall-clock time
/// starts at the Unix epoch.
#[derive(Debug)]
pub struct SteppingClock {
    origin: Instant,
    tick: Duration,
    system_tick: Duration,
    ticks: AtomicU64,
    system_ticks: AtomicU64,
}

impl SteppingClock {
    /// Create a clock where both timelines advance by `tick` per call
    pub fn new(tick: Duration) -> Self {
        Self::with_ticks(tick, tick)
    }

    /// Create a clock with separate monotonic and wall-clock steps
    pub fn with_ticks(tick: Duration, system_tick: Duration) -> Self {
        Self {
            origin: Instant::now(),
            tick,
            system_tick,
            ticks: AtomicU64::new(0),
            system_ticks: AtomicU64::new(0),
        }
    }

    /// Current monotonic reading without advancing
    pub fn peek(&self) -> Instant {
        self.origin + scale(self.tick, self.ticks.load(Ordering::Relaxed))
    }

    /// Move the monotonic timeline forward without producing a reading
    pub fn advance(&self, steps: u64) {
        self.ticks.fetch_add(steps, Ordering::Relaxed);
    }
}

fn scale(step: Duration, n: u64) -> Duration {
    Duration::from_nanos(u64::try_from(step.as_nanos()).unwrap_or(u64::MAX).saturating_mul(n))
}

impl TimeProvider for SteppingClock {
    fn now(&self) -> Instant {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        self.origin + scale(self.tick, n)
    }

    fn system_now(&self) -> SystemTime {
        let n = self.system_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        UNIX_EPOCH + scale(self.system_tick, n)
    }
}
