//! Clock abstraction for retry accounting and deterministic simulation.
//!
//! `RetryContext` measures the time between recorded failures through this
//! trait, so simulated tests can drive retries without touching wall-clock time.
//!
//! ## Design Principles (TigerStyle)
//!
//! 1. **Explicit time**: All time reads go through `Clock`
//! 2. **No hidden state**: Simulated time only moves when told to
//! 3. **Deterministic**: Same inputs produce same outputs in simulation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(duration_to_millis(rhs)))
    }
}

pub(crate) fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Source of "now" for the retry engine.
///
/// Implementations:
/// - `ProductionClock`: monotonic system time
/// - `SimulatedClock`: virtual time for DST
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Production clock backed by `Instant`.
#[derive(Clone)]
pub struct ProductionClock {
    start: Instant,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        ProductionClock {
            start: Instant::now(),
        }
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp(duration_to_millis(self.start.elapsed()))
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same underlying time.
#[derive(Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration_to_millis(duration), Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock_advances() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2.0 >= t1.0 + 10, "Should have elapsed at least 10ms");
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let clock = SimulatedClock::new(1000);

        let t1 = clock.now();
        let t2 = clock.now();
        assert_eq!(t1, t2, "Time should not advance without explicit call");

        clock.advance_ms(100);
        assert_eq!(clock.now().0, 1100);

        clock.set(5000);
        assert_eq!(clock.now().0, 5000);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::new(0);
        let clock2 = clock.clone();

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock2.current_ms(), 2000, "Clones should share state");
    }

    #[test]
    fn test_elapsed_and_arithmetic() {
        let clock = SimulatedClock::new(1000);
        let start = clock.now();
        clock.advance_ms(250);
        assert_eq!(clock.elapsed(start), Duration::from_millis(250));

        let ts = Timestamp::from_millis(1000) + Duration::from_millis(500);
        assert_eq!(ts.as_millis(), 1500);
        assert_eq!(Timestamp::ZERO.saturating_sub(ts), Duration::ZERO);
    }
}
