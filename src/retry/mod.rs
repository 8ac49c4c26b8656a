//! Retry engine: backoff math, failure classification, deferred continuations.

mod backoff;
mod context;
mod policy;
mod scheduler;

pub use backoff::{Backoff, BackoffBuilder, BackoffResult, Jitterer};
pub use context::{OnFailure, OnSuccess, RetryContext, RetryContextProvider};
pub use policy::{AlwaysRetry, DefaultRetryPolicy, NeverRetry, RetryPolicy};
pub use scheduler::{DirectScheduler, ManualScheduler, Scheduler, Task, TokioScheduler};
