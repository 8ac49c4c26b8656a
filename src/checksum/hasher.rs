use crate::checksum::value::{Crc32cLengthKnown, Crc32cValue};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;

/// Checksum strategy: compute CRC32C or skip it entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hasher {
    #[default]
    Enabled,
    Noop,
}

impl Hasher {
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Hasher::Enabled
        } else {
            Hasher::Noop
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Hasher::Enabled)
    }

    pub fn hash(&self, bytes: &[u8]) -> Option<Crc32cLengthKnown> {
        match self {
            Hasher::Enabled => Some(Crc32cLengthKnown::of_bytes(bytes)),
            Hasher::Noop => None,
        }
    }

    /// Hash several buffers as one contiguous sequence.
    pub fn hash_buffers(&self, buffers: &[Bytes]) -> Option<Crc32cLengthKnown> {
        match self {
            Hasher::Enabled => {
                let mut crc = 0u32;
                let mut length = 0u64;
                for b in buffers {
                    crc = crc32c::crc32c_append(crc, b);
                    length += b.len() as u64;
                }
                Some(Crc32cLengthKnown::new(crc, length))
            }
            Hasher::Noop => None,
        }
    }

    /// `DataLoss` if `bytes` do not hash to `expected`. Always passes when disabled.
    pub fn validate(&self, expected: Crc32cValue, bytes: &[u8]) -> StorageResult<()> {
        let Some(actual) = self.hash(bytes) else {
            return Ok(());
        };
        if expected.eq_value(&actual.into()) {
            Ok(())
        } else {
            Err(StorageError::DataLoss(format!(
                "Mismatch checksum value. Expected {} actual {}",
                expected, actual
            )))
        }
    }

    pub fn null_safe_concat(
        &self,
        first: Option<Crc32cLengthKnown>,
        second: Option<Crc32cLengthKnown>,
    ) -> Option<Crc32cLengthKnown> {
        match self {
            Hasher::Noop => None,
            Hasher::Enabled => match (first, second) {
                (None, second) => second,
                (Some(first), Some(second)) => Some(first.concat(second)),
                (Some(_), None) => None,
            },
        }
    }
}
