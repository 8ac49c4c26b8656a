//! Appendable object uploads over a resumable bidi stream.
//!
//! ## Architecture
//!
//! ```text
//! AppendableUpload::write(bytes)
//!        │ StreamingSegmenter → ChunkSegment (+crc32c)
//!        ▼
//! AppendStream ──lock──► AppendUploadState
//!        │                 queue of unconfirmed requests
//!        ▼
//! BidiTransport ◄── responses evict confirmed requests
//!                   errors → RetryContext → restart(state_lookup)
//! ```

mod state;
mod stream;
mod upload;

pub use state::{concatenate, AppendUploadState, UploadState, UploadTarget};
pub use stream::{AppendStream, AppendTransport};
pub use upload::AppendableUpload;
