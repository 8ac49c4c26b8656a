//! Multiplexed range reads over bidi streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    ObjectReadSession                       │
//! │  read_range() / read_stream()                              │
//! │        │                                                   │
//! │        ▼  capability matches?                              │
//! │  ┌──────────────────┐  no   ┌──────────────────┐           │
//! │  │ ReadSessionStream│──────►│ child stream(s)  │           │
//! │  │  (main)          │       │  forked state    │           │
//! │  └────────┬─────────┘       └────────┬─────────┘           │
//! │           │ ReadSessionState         │                     │
//! │           │  read_id → StreamRead    │                     │
//! └───────────┼──────────────────────────┼─────────────────────┘
//!             ▼                          ▼
//!      BidiTransport::open        BidiTransport::open
//! ```
//!
//! Every `StreamRead` has its own retry budget. The stream has another one
//! that governs reconnects.

mod op;
mod range;
mod session;
mod state;
mod stream;

pub use op::{OnClose, ReadFuture, ReadKind, ReadStream, StreamRead};
pub use range::{get_read_cursor, RangeSpec, ReadCursor};
pub use session::ObjectReadSession;
pub use state::ReadSessionState;
pub use stream::{ReadSessionStream, ReadTransport};
