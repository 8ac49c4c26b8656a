//! Per-operation retry bookkeeping.
//!
//! A `RetryContext` accumulates the failures of one logical operation (a read,
//! a stream, an upload) and decides, for each new failure, whether to schedule
//! another attempt or to give up with a `Cancelled` error carrying the whole
//! failure history.
//!
//! ## Architecture
//!
//! ```text
//! record_error(err, on_success, on_failure)
//!     │
//!     ├─ lock ─► elapsed since last record
//!     │          cancel unfinished pending backoff (charge its wait)
//!     │          Backoff::next_backoff(elapsed)
//!     │          RetryPolicy + attempt budget
//!     ├─ unlock
//!     │
//!     ├─ retry   ─► Scheduler::schedule(delay, on_success)
//!     └─ give up ─► on_failure(Cancelled { cause: err, suppressed: history })
//! ```
//!
//! Continuations always run without the context lock held.

use crate::clock::{Clock, ProductionClock, Timestamp};
use crate::config::RetrySettings;
use crate::error::{StorageError, StorageResult};
use crate::retry::backoff::{Backoff, BackoffResult, Jitterer};
use crate::retry::policy::{NeverRetry, RetryPolicy};
use crate::retry::scheduler::{DirectScheduler, Scheduler};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type OnSuccess = Box<dyn FnOnce() + Send + 'static>;
pub type OnFailure = Box<dyn FnOnce(StorageError) + Send + 'static>;

struct PendingBackoff {
    generation: u64,
    delay: Duration,
    scheduled_at: Timestamp,
    cancelled: Arc<AtomicBool>,
}

struct RetryState {
    backoff: Backoff,
    failures: Vec<StorageError>,
    last_recorded: Timestamp,
    pending: Option<PendingBackoff>,
    generation: u64,
    /// Set on give-up; every later error fails the same way until `reset`
    terminal: Option<&'static str>,
}

enum Decision {
    Retry {
        delay: Duration,
        generation: u64,
        cancelled: Arc<AtomicBool>,
    },
    GiveUp(StorageError),
}

/// Failure history and backoff state for one logical operation.
///
/// Clones share state.
#[derive(Clone)]
pub struct RetryContext {
    inner: Arc<Mutex<RetryState>>,
    scheduler: Arc<dyn Scheduler>,
    policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
}

impl RetryContext {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        policy: Arc<dyn RetryPolicy>,
        clock: Arc<dyn Clock>,
        backoff: Backoff,
        max_attempts: i32,
    ) -> Self {
        let now = clock.now();
        RetryContext {
            inner: Arc::new(Mutex::new(RetryState {
                backoff,
                failures: Vec::new(),
                last_recorded: now,
                pending: None,
                generation: 0,
                terminal: None,
            })),
            scheduler,
            policy,
            clock,
            max_attempts,
        }
    }

    /// Context that fails on the first recorded error.
    pub fn never_retry() -> Self {
        RetryContext::new(
            Arc::new(DirectScheduler),
            Arc::new(NeverRetry),
            Arc::new(ProductionClock::new()),
            Backoff::immediate(),
            1,
        )
    }

    /// True while a scheduled retry has not yet run.
    pub fn in_backoff(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    /// True once the context has given up; cleared by `reset`.
    pub fn is_terminal(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Number of failures recorded since the last reset.
    pub fn attempts(&self) -> usize {
        self.inner.lock().failures.len()
    }

    pub fn reset(&self) {
        let mut state = self.inner.lock();
        if let Some(pending) = state.pending.take() {
            pending.cancelled.store(true, Ordering::SeqCst);
        }
        state.failures.clear();
        state.terminal = None;
        state.backoff.reset();
        state.last_recorded = self.clock.now();
    }

    pub fn record_error(&self, error: StorageError, on_success: OnSuccess, on_failure: OnFailure) {
        let decision = self.decide(error);
        match decision {
            Decision::Retry {
                delay,
                generation,
                cancelled,
            } => {
                let inner = self.inner.clone();
                self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if cancelled.load(Ordering::SeqCst) {
                            return;
                        }
                        {
                            let mut state = inner.lock();
                            if state
                                .pending
                                .as_ref()
                                .is_some_and(|p| p.generation == generation)
                            {
                                state.pending = None;
                            }
                        }
                        on_success();
                    }),
                );
            }
            Decision::GiveUp(err) => on_failure(err),
        }
    }

    fn decide(&self, error: StorageError) -> Decision {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        let elapsed = now.saturating_sub(state.last_recorded);
        state.last_recorded = now;

        if let Some(pending) = state.pending.take() {
            pending.cancelled.store(true, Ordering::SeqCst);
            let waited = now.saturating_sub(pending.scheduled_at);
            state.backoff.backoff_interrupted(waited);
            debug!(
                previous_backoff = ?pending.delay,
                elapsed = ?waited,
                "Previous backoff interrupted by this error"
            );
        }

        if let Some(prefix) = state.terminal {
            let attempts = state.failures.len() + 1;
            warn!(attempts, error = %error, "{} (context already terminal)", prefix);
            let suppressed = state.failures.clone();
            state.failures.push(error.clone());
            return Decision::GiveUp(StorageError::Cancelled {
                message: format!(
                    "{} (attempts: {}, already terminal) previous failures follow in order of occurrence",
                    prefix, attempts
                ),
                cause: Some(Box::new(error)),
                suppressed,
            });
        }

        let cumulative_before = state.backoff.cumulative_backoff();
        let next = state.backoff.next_backoff(elapsed);
        let should_retry = self.policy.should_retry(&error);
        let attempts = state.failures.len() + 1;

        let prefix = if should_retry && self.max_attempts > 0 && attempts >= self.max_attempts as usize
        {
            Some("Operation failed to complete within attempt budget")
        } else if next.is_exhausted() {
            Some("Operation failed to complete within backoff budget")
        } else if !should_retry {
            Some("Unretryable error")
        } else {
            None
        };

        match (prefix, next) {
            (None, BackoffResult::Delay(delay)) => {
                state.failures.push(error);
                state.generation += 1;
                let cancelled = Arc::new(AtomicBool::new(false));
                state.pending = Some(PendingBackoff {
                    generation: state.generation,
                    delay,
                    scheduled_at: now,
                    cancelled: cancelled.clone(),
                });
                debug!(attempts, ?delay, "scheduling retry");
                Decision::Retry {
                    delay,
                    generation: state.generation,
                    cancelled,
                }
            }
            (prefix, _) => {
                let prefix = prefix.unwrap_or("Operation failed to complete within backoff budget");
                let mut message = format!("{} (attempts: {}", prefix, attempts);
                if self.max_attempts > 0 {
                    let _ = write!(message, ", maxAttempts: {}", self.max_attempts);
                }
                let _ = write!(
                    message,
                    ", elapsed: {:?}, nextBackoff: {}",
                    cumulative_before, next
                );
                if let Some(timeout) = state.backoff.timeout() {
                    let _ = write!(message, ", timeout: {:?}", timeout);
                }
                message.push(')');
                if !state.failures.is_empty() {
                    message.push_str(" previous failures follow in order of occurrence");
                }
                warn!(attempts, error = %error, "{}", prefix);
                let suppressed = state.failures.clone();
                state.failures.push(error.clone());
                state.terminal = Some(prefix);
                Decision::GiveUp(StorageError::Cancelled {
                    message,
                    cause: Some(Box::new(error)),
                    suppressed,
                })
            }
        }
    }
}

impl std::fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RetryContext")
            .field("failures", &state.failures.len())
            .field("in_backoff", &state.pending.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Factory producing independent contexts that share scheduler, policy and clock.
#[derive(Clone)]
pub struct RetryContextProvider {
    scheduler: Arc<dyn Scheduler>,
    policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    max_attempts: i32,
}

impl RetryContextProvider {
    pub fn new(
        settings: &RetrySettings,
        scheduler: Arc<dyn Scheduler>,
        policy: Arc<dyn RetryPolicy>,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        settings.validate()?;
        Ok(RetryContextProvider {
            scheduler,
            policy,
            clock,
            backoff: Backoff::from_settings(settings)?,
            max_attempts: settings.max_attempts,
        })
    }

    /// Replace the jitter source of every context created afterwards.
    pub fn with_jitterer(mut self, jitterer: Jitterer) -> Self {
        self.backoff = self.backoff.with_jitterer(jitterer);
        self
    }

    pub fn create(&self) -> RetryContext {
        let mut backoff = self.backoff.clone();
        backoff.reset();
        RetryContext::new(
            self.scheduler.clone(),
            self.policy.clone(),
            self.clock.clone(),
            backoff,
            self.max_attempts,
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::error::Code;
    use crate::retry::policy::{AlwaysRetry, DefaultRetryPolicy};
    use crate::retry::scheduler::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        scheduler: Arc<ManualScheduler>,
        clock: SimulatedClock,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = SimulatedClock::new(0);
            Fixture {
                scheduler: Arc::new(ManualScheduler::new(clock.clone())),
                clock,
            }
        }

        fn context(&self, policy: Arc<dyn RetryPolicy>, timeout_secs: u64, max_attempts: i32) -> RetryContext {
            let backoff = Backoff::builder()
                .initial_backoff(Duration::from_secs(1))
                .max_backoff(Duration::from_secs(8))
                .timeout(Duration::from_secs(timeout_secs))
                .retry_delay_multiplier(2.0)
                .jitterer(Jitterer::no_jitter())
                .build()
                .unwrap();
            RetryContext::new(
                self.scheduler.clone(),
                policy,
                Arc::new(self.clock.clone()),
                backoff,
                max_attempts,
            )
        }
    }

    type Captured = Arc<Mutex<Option<StorageError>>>;

    fn callbacks() -> (Arc<AtomicUsize>, Captured, OnSuccess, OnFailure) {
        let successes = Arc::new(AtomicUsize::new(0));
        let failure: Captured = Arc::new(Mutex::new(None));
        let s = successes.clone();
        let f = failure.clone();
        (
            successes,
            failure,
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |e| {
                *f.lock() = Some(e);
            }),
        )
    }

    #[test]
    fn test_retry_scheduled_after_delay() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(DefaultRetryPolicy), 60, 0);
        let (successes, failure, ok, err) = callbacks();

        ctx.record_error(StorageError::unavailable("blip"), ok, err);
        assert!(ctx.in_backoff());
        assert_eq!(successes.load(Ordering::SeqCst), 0);

        fx.scheduler.advance(Duration::from_millis(999));
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        fx.scheduler.advance(Duration::from_millis(1));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(!ctx.in_backoff());
        assert!(failure.lock().is_none());
        assert_eq!(ctx.attempts(), 1);
    }

    #[test]
    fn test_attempt_budget_carries_history() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(AlwaysRetry), 600, 3);

        for i in 0..2 {
            let (_, failure, ok, err) = callbacks();
            ctx.record_error(StorageError::unavailable(format!("e{}", i)), ok, err);
            assert!(failure.lock().is_none());
            fx.scheduler.run_until_idle(10);
        }

        let (successes, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("e2"), ok, err);
        assert_eq!(successes.load(Ordering::SeqCst), 0);

        let failure = failure.lock().take().unwrap();
        let message = failure.to_string();
        assert!(
            message.starts_with(
                "Operation failed to complete within attempt budget (attempts: 3, maxAttempts: 3"
            ),
            "{}",
            message
        );
        assert!(message.ends_with("previous failures follow in order of occurrence"));
        assert_eq!(failure.cause().unwrap().to_string(), "UNAVAILABLE: e2");
        let suppressed: Vec<String> = failure.suppressed().iter().map(|e| e.to_string()).collect();
        assert_eq!(suppressed, vec!["UNAVAILABLE: e0", "UNAVAILABLE: e1"]);
    }

    #[test]
    fn test_backoff_budget_exhausted() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(AlwaysRetry), 3, 0);

        let (_, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("first"), ok, err);
        assert!(failure.lock().is_none());
        fx.scheduler.run_until_idle(10);

        fx.clock.advance(Duration::from_secs(5));
        let (_, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("second"), ok, err);
        let failure = failure.lock().take().unwrap();
        let message = failure.to_string();
        assert!(
            message.starts_with("Operation failed to complete within backoff budget (attempts: 2, elapsed: "),
            "{}",
            message
        );
        assert!(message.contains("nextBackoff: EXHAUSTED, timeout: 3s)"), "{}", message);
        assert_eq!(failure.suppressed().len(), 1);
    }

    #[test]
    fn test_unretryable_error_has_no_history_suffix() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(DefaultRetryPolicy), 60, 0);
        let (_, failure, ok, err) = callbacks();

        ctx.record_error(StorageError::DataLoss("crc".into()), ok, err);
        let failure = failure.lock().take().unwrap();
        assert_eq!(
            failure.to_string(),
            "Unretryable error (attempts: 1, elapsed: 0ns, nextBackoff: 1s, timeout: 60s)"
        );
        assert_eq!(failure.root_cause().code(), Code::DataLoss);
        assert!(!ctx.in_backoff());
    }

    #[test]
    fn test_new_error_interrupts_pending_backoff() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(AlwaysRetry), 60, 0);

        let (first_successes, _, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("a"), ok, err);
        fx.clock.advance(Duration::from_millis(400));

        let (second_successes, _, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("b"), ok, err);
        assert!(ctx.in_backoff());

        fx.scheduler.run_until_idle(10);
        assert_eq!(first_successes.load(Ordering::SeqCst), 0, "interrupted retry must not run");
        assert_eq!(second_successes.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.attempts(), 2);
    }

    #[test]
    fn test_reset_clears_history_and_pending() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(AlwaysRetry), 60, 2);

        let (successes, _, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("a"), ok, err);
        ctx.reset();
        assert!(!ctx.in_backoff());
        fx.scheduler.run_until_idle(10);
        assert_eq!(successes.load(Ordering::SeqCst), 0);

        // budget of 2 is available again
        let (successes, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("b"), ok, err);
        fx.scheduler.run_until_idle(10);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(failure.lock().is_none());
    }

    #[test]
    fn test_terminal_context_stays_terminal_until_reset() {
        let fx = Fixture::new();
        let ctx = fx.context(Arc::new(DefaultRetryPolicy), 60, 0);

        let (_, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::DataLoss("crc".into()), ok, err);
        assert!(failure.lock().is_some());
        assert!(ctx.is_terminal());

        // retryable on its own, but the context already gave up
        let (successes, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("later"), ok, err);
        fx.scheduler.run_until_idle(10);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert!(!ctx.in_backoff());
        let failure = failure.lock().take().unwrap();
        assert!(failure.to_string().starts_with("Unretryable error"), "{}", failure);
        assert_eq!(failure.cause().unwrap().to_string(), "UNAVAILABLE: later");
        assert_eq!(failure.suppressed().len(), 1);
        assert_eq!(failure.suppressed()[0].code(), Code::DataLoss);

        ctx.reset();
        assert!(!ctx.is_terminal());
        let (successes, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("fresh"), ok, err);
        fx.scheduler.run_until_idle(10);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(failure.lock().is_none());
    }

    #[test]
    fn test_never_retry_fails_immediately() {
        let ctx = RetryContext::never_retry();
        let (successes, failure, ok, err) = callbacks();
        ctx.record_error(StorageError::unavailable("x"), ok, err);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        let failure = failure.lock().take().unwrap();
        assert!(failure.to_string().starts_with("Unretryable error (attempts: 1, maxAttempts: 1"));
    }

    #[test]
    fn test_provider_creates_independent_contexts() {
        let fx = Fixture::new();
        let provider = RetryContextProvider::new(
            &RetrySettings::test(),
            fx.scheduler.clone(),
            Arc::new(DefaultRetryPolicy),
            Arc::new(fx.clock.clone()),
        )
        .unwrap();

        let a = provider.create();
        let b = provider.create();
        let (_, _, ok, err) = callbacks();
        a.record_error(StorageError::unavailable("x"), ok, err);
        assert!(a.in_backoff());
        assert!(!b.in_backoff());
        assert_eq!(b.attempts(), 0);
    }
}
