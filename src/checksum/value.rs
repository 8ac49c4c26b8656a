//! CRC32C values and lossless combination.
//!
//! `concat(a, b)` yields the CRC32C of `bytes(a) ++ bytes(b)` from the two
//! checksums and the length of `b` alone, via `crc32c::crc32c_combine`.
//!
//! The operation is associative over contiguous decompositions of the same
//! byte range, but not commutative: operands must be adjacent and in order.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// A checksum paired with the exact byte length it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Crc32cLengthKnown {
    value: u32,
    length: u64,
}

impl Crc32cLengthKnown {
    /// Checksum of the empty byte sequence.
    pub const ZERO: Crc32cLengthKnown = Crc32cLengthKnown {
        value: 0,
        length: 0,
    };

    pub fn new(value: u32, length: u64) -> Self {
        Crc32cLengthKnown { value, length }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Crc32cLengthKnown {
            value: crc32c::crc32c(bytes),
            length: bytes.len() as u64,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Checksum of `self`'s bytes immediately followed by `other`'s.
    pub fn concat(&self, other: Crc32cLengthKnown) -> Crc32cLengthKnown {
        Crc32cLengthKnown {
            value: crc32c::crc32c_combine(self.value, other.value, combine_len(other.length)),
            length: self.length + other.length,
        }
    }
}

impl fmt::Display for Crc32cLengthKnown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crc32c{{0x{:08x}}} (length = {})", self.value, self.length)
    }
}

/// A CRC32C that may or may not know how many bytes it covers.
///
/// Values read off the wire are `LengthUnknown`; they can be compared but not
/// combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crc32cValue {
    LengthKnown(Crc32cLengthKnown),
    LengthUnknown(u32),
}

impl Crc32cValue {
    pub fn of(value: u32) -> Self {
        Crc32cValue::LengthUnknown(value)
    }

    pub fn with_length(value: u32, length: u64) -> Self {
        Crc32cValue::LengthKnown(Crc32cLengthKnown::new(value, length))
    }

    pub fn value(&self) -> u32 {
        match self {
            Crc32cValue::LengthKnown(k) => k.value,
            Crc32cValue::LengthUnknown(v) => *v,
        }
    }

    pub fn length(&self) -> Option<u64> {
        match self {
            Crc32cValue::LengthKnown(k) => Some(k.length),
            Crc32cValue::LengthUnknown(_) => None,
        }
    }

    /// Compare checksum values, ignoring length.
    pub fn eq_value(&self, other: &Crc32cValue) -> bool {
        self.value() == other.value()
    }

    pub fn concat(&self, other: Crc32cLengthKnown) -> StorageResult<Crc32cValue> {
        match self {
            Crc32cValue::LengthKnown(k) => Ok(Crc32cValue::LengthKnown(k.concat(other))),
            Crc32cValue::LengthUnknown(v) => Err(StorageError::IllegalState(format!(
                "concat is not defined for a checksum of unknown length (crc32c{{0x{:08x}}})",
                v
            ))),
        }
    }
}

impl From<Crc32cLengthKnown> for Crc32cValue {
    fn from(value: Crc32cLengthKnown) -> Self {
        Crc32cValue::LengthKnown(value)
    }
}

impl fmt::Display for Crc32cValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crc32cValue::LengthKnown(k) => k.fmt(f),
            Crc32cValue::LengthUnknown(v) => write!(f, "crc32c{{0x{:08x}}}", v),
        }
    }
}

/// Lengths beyond `usize` only arise on 32-bit targets.
fn combine_len(length: u64) -> usize {
    usize::try_from(length).unwrap_or(usize::MAX)
}
