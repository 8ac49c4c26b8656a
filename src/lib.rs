//! Client-side engine for bidirectional streaming object storage.
//!
//! Two protocols share one retry and checksum layer:
//!
//! - [`read::ObjectReadSession`] multiplexes many range reads over one
//!   resumable read stream, recovering from drops and redirects.
//! - [`write::AppendableUpload`] appends checksummed chunks to an object
//!   and reconciles with the server after every reconnect.
//!
//! [`queue::AsyncAppendingQueue`] folds a sequence of futures into one
//! result, and [`simulator`] provides a deterministic server for testing.

pub mod checksum;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod queue;
pub mod read;
pub mod retry;
pub mod simulator;
pub mod transport;
pub mod wire;
pub mod write;

pub use checksum::{ChunkSegment, ChunkSegmenter, Crc32cLengthKnown, Crc32cValue, Hasher};
pub use config::{AppendConfig, BidiConfig, ChunkingConfig, ReadSessionConfig, RetrySettings};
pub use error::{Code, StorageError, StorageResult};
pub use queue::AsyncAppendingQueue;
pub use read::{ObjectReadSession, RangeSpec};
pub use retry::{Backoff, RetryContext, RetryContextProvider};
pub use write::{AppendStream, AppendableUpload};
