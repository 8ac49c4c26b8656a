//! Truncated exponential backoff with jitter and a cumulative time budget.
//!
//! ```text
//! next_backoff(elapsed):
//!   cumulative += elapsed
//!   cumulative >= timeout           → Exhausted (sticky until reset)
//!   next  = round(previous * mult)  (initial on first call)
//!   delay = min(jitter(next), max, timeout - cumulative)
//!   previous = delay
//! ```
//!
//! Every `Delay` keeps `cumulative + delay <= timeout`, so a caller that waits
//! out each delay can never overshoot the budget.

use crate::config::{JitterMode, RetrySettings};
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of [`Backoff::next_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffResult {
    Delay(Duration),
    Exhausted,
}

impl BackoffResult {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, BackoffResult::Exhausted)
    }
}

impl fmt::Display for BackoffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffResult::Delay(d) => write!(f, "{:?}", d),
            BackoffResult::Exhausted => f.write_str("EXHAUSTED"),
        }
    }
}

/// Randomization applied to a computed delay.
#[derive(Clone, Default)]
pub enum Jitterer {
    None,
    /// Uniform in `[0, d)` from the thread RNG
    #[default]
    Uniform,
    /// Uniform in `[0, d)` from a seeded ChaCha stream
    Seeded(Arc<Mutex<ChaCha8Rng>>),
    Custom(Arc<dyn Fn(Duration) -> Duration + Send + Sync>),
}

impl Jitterer {
    pub fn no_jitter() -> Self {
        Jitterer::None
    }

    pub fn seeded(seed: u64) -> Self {
        Jitterer::Seeded(Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))))
    }

    pub fn custom(f: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        Jitterer::Custom(Arc::new(f))
    }

    pub fn apply(&self, d: Duration) -> Duration {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        match self {
            Jitterer::None => d,
            _ if nanos == 0 => d,
            Jitterer::Uniform => Duration::from_nanos(rand::thread_rng().gen_range(0..nanos)),
            Jitterer::Seeded(rng) => Duration::from_nanos(rng.lock().gen_range(0..nanos)),
            Jitterer::Custom(f) => f(d),
        }
    }
}

impl fmt::Debug for Jitterer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jitterer::None => f.write_str("Jitterer::None"),
            Jitterer::Uniform => f.write_str("Jitterer::Uniform"),
            Jitterer::Seeded(_) => f.write_str("Jitterer::Seeded"),
            Jitterer::Custom(_) => f.write_str("Jitterer::Custom"),
        }
    }
}

impl From<JitterMode> for Jitterer {
    fn from(mode: JitterMode) -> Self {
        match mode {
            JitterMode::None => Jitterer::None,
            JitterMode::Uniform => Jitterer::Uniform,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackoffBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    timeout: Duration,
    multiplier: f64,
    jitterer: Jitterer,
}

impl BackoffBuilder {
    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = Some(d);
        self
    }

    pub fn max_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = Some(d);
        self
    }

    /// `Duration::ZERO` disables the time budget.
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    pub fn retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitterer(mut self, jitterer: Jitterer) -> Self {
        self.jitterer = jitterer;
        self
    }

    pub fn build(self) -> StorageResult<Backoff> {
        let initial = self.initial_backoff.ok_or_else(|| {
            StorageError::InvalidArgument("initial_backoff must be provided".to_string())
        })?;
        let max = self.max_backoff.ok_or_else(|| {
            StorageError::InvalidArgument("max_backoff must be provided".to_string())
        })?;
        if !(self.multiplier >= 1.0) {
            return Err(StorageError::InvalidArgument(format!(
                "retry_delay_multiplier must be >= 1.0 (was {})",
                self.multiplier
            )));
        }
        let timeout = if self.timeout.is_zero() {
            Duration::MAX
        } else {
            self.timeout
        };
        Ok(Backoff {
            initial,
            max,
            timeout,
            multiplier: self.multiplier,
            jitterer: self.jitterer,
            previous: Duration::ZERO,
            cumulative: Duration::ZERO,
            interrupted_credit: Duration::ZERO,
            exhausted: false,
        })
    }
}

/// Stateful delay calculator for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    timeout: Duration,
    multiplier: f64,
    jitterer: Jitterer,
    previous: Duration,
    cumulative: Duration,
    /// Elapsed time already charged by `backoff_interrupted`
    interrupted_credit: Duration,
    exhausted: bool,
}

impl Backoff {
    pub fn builder() -> BackoffBuilder {
        BackoffBuilder {
            multiplier: 2.0,
            ..BackoffBuilder::default()
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> StorageResult<Backoff> {
        Backoff::builder()
            .initial_backoff(settings.initial_backoff)
            .max_backoff(settings.max_backoff)
            .timeout(settings.total_timeout)
            .retry_delay_multiplier(settings.retry_delay_multiplier)
            .jitterer(settings.jitter.into())
            .build()
    }

    /// Zero delays and no time budget.
    pub fn immediate() -> Backoff {
        Backoff {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            timeout: Duration::MAX,
            multiplier: 1.0,
            jitterer: Jitterer::None,
            previous: Duration::ZERO,
            cumulative: Duration::ZERO,
            interrupted_credit: Duration::ZERO,
            exhausted: false,
        }
    }

    pub fn with_jitterer(mut self, jitterer: Jitterer) -> Backoff {
        self.jitterer = jitterer;
        self
    }

    pub fn next_backoff(&mut self, elapsed: Duration) -> BackoffResult {
        let charged = elapsed.saturating_sub(self.interrupted_credit);
        self.interrupted_credit = Duration::ZERO;
        self.cumulative = self.cumulative.saturating_add(charged);

        if self.exhausted || self.cumulative >= self.timeout {
            self.exhausted = true;
            return BackoffResult::Exhausted;
        }

        let next = if self.previous.is_zero() {
            self.initial
        } else {
            let scaled = (self.previous.as_nanos() as f64 * self.multiplier).round();
            Duration::from_nanos(scaled.min(u64::MAX as f64) as u64)
        };
        let remaining = self.timeout - self.cumulative;
        let delay = self.jitterer.apply(next).min(self.max).min(remaining);
        self.previous = delay;

        debug_assert!(self.cumulative.saturating_add(delay) <= self.timeout);
        BackoffResult::Delay(delay)
    }

    /// Charge the time a cancelled delay actually waited.
    ///
    /// The same interval will be reported again as `elapsed` on the next
    /// `next_backoff`; only the part not charged here is added then.
    pub fn backoff_interrupted(&mut self, actual_elapsed: Duration) {
        self.cumulative = self.cumulative.saturating_add(actual_elapsed);
        self.interrupted_credit = self.interrupted_credit.saturating_add(actual_elapsed);
        if self.cumulative >= self.timeout {
            self.exhausted = true;
        }
    }

    pub fn reset(&mut self) {
        self.previous = Duration::ZERO;
        self.cumulative = Duration::ZERO;
        self.interrupted_credit = Duration::ZERO;
        self.exhausted = false;
    }

    pub fn cumulative_backoff(&self) -> Duration {
        self.cumulative
    }

    /// `None` when no time budget is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout != Duration::MAX).then_some(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn delay(s: u64) -> BackoffResult {
        BackoffResult::Delay(secs(s))
    }

    fn backoff(initial: u64, max: u64, timeout: u64, multiplier: f64) -> Backoff {
        Backoff::builder()
            .initial_backoff(secs(initial))
            .max_backoff(secs(max))
            .timeout(secs(timeout))
            .retry_delay_multiplier(multiplier)
            .jitterer(Jitterer::no_jitter())
            .build()
            .unwrap()
    }

    #[test]
    fn test_simple_sequence_until_exhausted() {
        let mut b = backoff(2, 57, 420, 2.0);
        let elapsed = [2, 2, 4, 8, 16, 32, 57, 57, 57, 57, 57, 57];
        let expected = [2, 4, 8, 16, 32, 57, 57, 57, 57, 57, 57, 14];
        for (e, want) in elapsed.iter().zip(expected.iter()) {
            assert_eq!(b.next_backoff(secs(*e)), delay(*want), "elapsed {}", e);
        }
        assert_eq!(b.cumulative_backoff(), secs(406));
        assert_eq!(b.next_backoff(secs(14)), BackoffResult::Exhausted);
        assert_eq!(b.cumulative_backoff(), secs(420));
    }

    #[test]
    fn test_errors_arriving_before_backoff_elapses() {
        let mut b = backoff(2, 11, 34, 2.0);
        assert_eq!(b.next_backoff(secs(1)), delay(2));
        assert_eq!(b.next_backoff(Duration::from_millis(300)), delay(4));
        assert_eq!(b.next_backoff(secs(7)), delay(8));
        assert_eq!(b.next_backoff(secs(13)), delay(11));
        assert_eq!(b.next_backoff(secs(18)), BackoffResult::Exhausted);
    }

    #[test]
    fn test_delay_limited_by_remaining_budget() {
        let mut b = backoff(2, 57, 420, 2.0);
        assert_eq!(b.next_backoff(secs(418)), delay(2));
        assert_eq!(b.next_backoff(secs(2)), BackoffResult::Exhausted);
    }

    #[test]
    fn test_truncated_to_remaining() {
        let mut b = backoff(2, 6, 24, 2.0);
        assert_eq!(b.next_backoff(secs(22)), delay(2));
        assert_eq!(b.next_backoff(secs(2)), BackoffResult::Exhausted);

        let mut b = backoff(2, 6, 24, 2.0);
        assert_eq!(b.next_backoff(secs(21)), delay(2));
        assert_eq!(b.cumulative_backoff(), secs(21));
        assert_eq!(b.next_backoff(secs(2)), delay(1));
        assert_eq!(b.cumulative_backoff(), secs(23));
        assert_eq!(b.next_backoff(secs(1)), BackoffResult::Exhausted);
        assert_eq!(b.cumulative_backoff(), secs(24));
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut b = backoff(2, 5, 6, 2.0);
        assert_eq!(b.next_backoff(secs(4)), delay(2));
        assert_eq!(b.next_backoff(secs(2)), BackoffResult::Exhausted);
        b.reset();
        assert_eq!(b.next_backoff(secs(10)), BackoffResult::Exhausted);
    }

    #[test]
    fn test_exhausted_is_sticky() {
        let mut b = backoff(2, 5, 5, 1.0);
        assert_eq!(b.next_backoff(secs(5)), BackoffResult::Exhausted);
        assert_eq!(b.next_backoff(Duration::ZERO), BackoffResult::Exhausted);
        b.reset();
        assert_eq!(b.next_backoff(Duration::ZERO), delay(2));
    }

    #[test]
    fn test_interrupted_backoff_charged_once() {
        let mut b = backoff(2, 60, 100, 2.0);
        assert_eq!(b.next_backoff(Duration::ZERO), delay(2));
        b.backoff_interrupted(secs(1));
        assert_eq!(b.cumulative_backoff(), secs(1));
        // the same second is reported again by the caller
        assert_eq!(b.next_backoff(secs(1)), delay(4));
        assert_eq!(b.cumulative_backoff(), secs(1));
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let mut b = backoff(1, 1, 0, 1.0);
        assert_eq!(b.timeout(), None);
        for _ in 0..1000 {
            assert_eq!(b.next_backoff(secs(3600)), delay(1));
        }
    }

    #[test]
    fn test_builder_validation() {
        let err = Backoff::builder()
            .initial_backoff(secs(1))
            .max_backoff(secs(2))
            .retry_delay_multiplier(0.9)
            .build()
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        let err = Backoff::builder().max_backoff(secs(2)).build().unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_jitter_stays_below_delay() {
        let mut b = Backoff::builder()
            .initial_backoff(secs(4))
            .max_backoff(secs(4))
            .retry_delay_multiplier(1.0)
            .jitterer(Jitterer::seeded(7))
            .build()
            .unwrap();
        for _ in 0..100 {
            match b.next_backoff(Duration::ZERO) {
                BackoffResult::Delay(d) => assert!(d < secs(4)),
                BackoffResult::Exhausted => panic!("no timeout configured"),
            }
            b.reset();
        }
    }

    #[test]
    fn test_seeded_jitter_deterministic() {
        let a = Jitterer::seeded(42);
        let b = Jitterer::seeded(42);
        for _ in 0..20 {
            assert_eq!(a.apply(secs(10)), b.apply(secs(10)));
        }
    }

    #[test]
    fn test_sub_millisecond_delays_grow() {
        let mut b = Backoff::builder()
            .initial_backoff(Duration::from_micros(200))
            .max_backoff(secs(1))
            .retry_delay_multiplier(2.0)
            .jitterer(Jitterer::no_jitter())
            .build()
            .unwrap();
        for expected in [200, 400, 800, 1600] {
            assert_eq!(
                b.next_backoff(Duration::ZERO),
                BackoffResult::Delay(Duration::from_micros(expected))
            );
        }
    }

    #[test]
    fn test_fractional_multiplier_keeps_nanos() {
        let mut b = Backoff::builder()
            .initial_backoff(Duration::from_nanos(1_000_001))
            .max_backoff(secs(1))
            .retry_delay_multiplier(1.5)
            .jitterer(Jitterer::no_jitter())
            .build()
            .unwrap();
        b.next_backoff(Duration::ZERO);
        assert_eq!(
            b.next_backoff(Duration::ZERO),
            BackoffResult::Delay(Duration::from_nanos(1_500_002))
        );
    }

    fn sample_delays() -> Vec<Duration> {
        vec![
            Duration::from_nanos(1),
            Duration::from_nanos(2),
            Duration::from_micros(3),
            Duration::from_millis(250),
            secs(1),
            secs(3600),
        ]
    }

    #[test]
    fn test_no_jitter_is_identity() {
        let j = Jitterer::no_jitter();
        assert_eq!(j.apply(Duration::ZERO), Duration::ZERO);
        for d in sample_delays() {
            assert_eq!(j.apply(d), d);
        }
    }

    #[test]
    fn test_uniform_jitter_in_range() {
        let j = Jitterer::Uniform;
        assert_eq!(j.apply(Duration::ZERO), Duration::ZERO);
        for d in sample_delays() {
            for _ in 0..50 {
                assert!(j.apply(d) < d, "{:?}", d);
            }
        }
        assert!(matches!(Jitterer::default(), Jitterer::Uniform));
    }

    #[test]
    fn test_seeded_jitter_in_range() {
        let j = Jitterer::seeded(11);
        assert_eq!(j.apply(Duration::ZERO), Duration::ZERO);
        for d in sample_delays() {
            for _ in 0..50 {
                assert!(j.apply(d) < d, "{:?}", d);
            }
        }
    }
}
