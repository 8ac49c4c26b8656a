//! Error taxonomy shared by every layer of the protocol engine.
//!
//! Errors fall into five groups:
//!
//! - **Input validation** (`InvalidArgument`): fail fast, never retried
//! - **Transport status** (`Status`): classified by [`Code`] and handed to a
//!   [`RetryPolicy`](crate::retry::RetryPolicy)
//! - **Session redirects** (`ReadRedirected`, `WriteRedirected`): reroute a whole
//!   session instead of failing an operation
//! - **Data integrity** (`DataLoss`): checksum or acknowledged-offset mismatch
//! - **Protocol/state** (`IllegalState`, `ShortCircuited`, `NeverAppendedTo`)
//!
//! `Cancelled` is the terminal shape produced when a retry budget runs out; it
//! carries the triggering error and every earlier failure in record order.
//!
//! Errors are `Clone` so a single failure can resolve many shared futures.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// gRPC-style status codes used by the wire model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Failure of a single read carried inside a stream-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRangeError {
    pub read_id: u64,
    pub code: Code,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("{code}: {message}")]
    Status { code: Code, message: String },

    #[error("read session redirected (routing_token: {routing_token:?})")]
    ReadRedirected {
        routing_token: Option<String>,
        read_handle: Option<Bytes>,
    },

    #[error("write session redirected (routing_token: {routing_token:?}, generation: {generation:?})")]
    WriteRedirected {
        routing_token: Option<String>,
        write_handle: Option<Bytes>,
        generation: Option<u64>,
    },

    #[error("{message} ({} read range errors)", .errors.len())]
    ReadRangeErrors {
        message: String,
        errors: Vec<ReadRangeError>,
    },

    #[error("data loss: {0}")]
    DataLoss(String),

    #[error("{message}")]
    Cancelled {
        message: String,
        cause: Option<Box<StorageError>>,
        suppressed: Vec<StorageError>,
    },

    #[error("Short Circuiting due to previously failed future: {0}")]
    ShortCircuited(Box<StorageError>),

    #[error("Never appended to")]
    NeverAppendedTo,
}

impl StorageError {
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        StorageError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::status(Code::Unavailable, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::status(Code::Aborted, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::status(Code::OutOfRange, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        StorageError::Cancelled {
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    pub fn stream_closed() -> Self {
        StorageError::IllegalState("Stream closed".to_string())
    }

    /// Status code this error would carry on the wire.
    pub fn code(&self) -> Code {
        match self {
            StorageError::InvalidArgument(_) => Code::InvalidArgument,
            StorageError::IllegalState(_) => Code::FailedPrecondition,
            StorageError::Status { code, .. } => *code,
            StorageError::ReadRedirected { .. } | StorageError::WriteRedirected { .. } => {
                Code::Aborted
            }
            StorageError::ReadRangeErrors { .. } => Code::Aborted,
            StorageError::DataLoss(_) => Code::DataLoss,
            StorageError::Cancelled { .. } => Code::Cancelled,
            StorageError::ShortCircuited(_) => Code::Cancelled,
            StorageError::NeverAppendedTo => Code::NotFound,
        }
    }

    /// Triggering error of a `Cancelled` or `ShortCircuited` failure.
    pub fn cause(&self) -> Option<&StorageError> {
        match self {
            StorageError::Cancelled { cause, .. } => cause.as_deref(),
            StorageError::ShortCircuited(cause) => Some(cause),
            _ => None,
        }
    }

    /// Earlier failures recorded on the same retry context, oldest first.
    pub fn suppressed(&self) -> &[StorageError] {
        match self {
            StorageError::Cancelled { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled { .. })
    }

    /// Walks `Cancelled` wrappers down to the originating error.
    pub fn root_cause(&self) -> &StorageError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}
