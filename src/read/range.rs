use crate::error::{StorageError, StorageResult};
use std::fmt;

/// A logical byte range of an object. `limit: None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RangeSpec {
    begin: u64,
    limit: Option<u64>,
}

impl RangeSpec {
    pub fn all() -> Self {
        RangeSpec {
            begin: 0,
            limit: None,
        }
    }

    pub fn begin_at(begin: u64) -> Self {
        RangeSpec { begin, limit: None }
    }

    /// Validating constructor. A `limit` of zero means "no limit".
    pub fn of(begin: i64, limit: i64) -> StorageResult<Self> {
        if begin < 0 {
            return Err(StorageError::InvalidArgument(format!(
                "range begin must be >= 0 (range begin = {})",
                begin
            )));
        }
        if limit < 0 {
            return Err(StorageError::InvalidArgument(format!(
                "range limit must be >= 0 (range limit = {})",
                limit
            )));
        }
        Ok(RangeSpec {
            begin: begin as u64,
            limit: (limit != 0).then_some(limit as u64),
        })
    }

    pub fn with_limit(self, limit: u64) -> Self {
        RangeSpec {
            begin: self.begin,
            limit: Some(limit),
        }
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limit {
            Some(limit) => write!(f, "RangeSpec{{begin={}, limit={}}}", self.begin, limit),
            None => write!(f, "RangeSpec{{begin={}}}", self.begin),
        }
    }
}

/// A range resolved against a known object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    begin: u64,
    end: u64,
}

impl ReadCursor {
    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.begin
    }

    pub fn has_remaining(&self) -> bool {
        self.end > self.begin
    }
}

pub fn get_read_cursor(range: RangeSpec, object_size: u64) -> StorageResult<ReadCursor> {
    let begin = range.begin();
    if begin > object_size {
        return Err(StorageError::out_of_range(format!(
            "range begin must be < objectSize (range begin = {}, object size = {})",
            begin, object_size
        )));
    }
    let end = begin
        .saturating_add(range.limit().unwrap_or(u64::MAX))
        .min(object_size);
    debug_assert!(begin <= end);
    Ok(ReadCursor { begin, end })
}
