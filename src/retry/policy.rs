//! Retry classification.

use crate::error::{Code, StorageError};

/// Decides whether a failure is worth another attempt.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, error: &StorageError) -> bool;
}

/// Retries transient transport codes and offset reconciliations.
///
/// Never retries data integrity failures, argument errors, or state errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, error: &StorageError) -> bool {
        match error {
            StorageError::InvalidArgument(_)
            | StorageError::IllegalState(_)
            | StorageError::DataLoss(_)
            | StorageError::Cancelled { .. }
            | StorageError::ShortCircuited(_)
            | StorageError::NeverAppendedTo => false,
            StorageError::ReadRedirected { .. }
            | StorageError::WriteRedirected { .. }
            | StorageError::ReadRangeErrors { .. } => true,
            StorageError::Status { code, .. } => matches!(
                code,
                Code::Unavailable
                    | Code::Internal
                    | Code::ResourceExhausted
                    | Code::DeadlineExceeded
                    | Code::Aborted
                    | Code::Unknown
                    | Code::OutOfRange
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryPolicy for AlwaysRetry {
    fn should_retry(&self, _error: &StorageError) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn should_retry(&self, _error: &StorageError) -> bool {
        false
    }
}
