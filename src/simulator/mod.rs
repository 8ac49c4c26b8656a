//! Deterministic in-process storage service and simulation harnesses.
//!
//! `SimulatedStorageServer` answers both bidi protocols from a seeded RNG.
//! Responses are queued rather than delivered inline; `pump` hands one event
//! to its observer with no simulator lock held, so a test decides exactly
//! when the client sees each response.

mod rng;
pub mod dst;
pub mod server;

pub use dst::{
    run_append_dst_batch, run_read_dst_batch, summarize_batch, AppendDstConfig, AppendDstHarness,
    AppendDstResult, DstOutcome, ReadDstConfig, ReadDstHarness, ReadDstResult,
};
pub use rng::DeterministicRng;
pub use server::{
    SimulatedAppendTransport, SimulatedReadTransport, SimulatedServerConfig, SimulatedServerStats,
    SimulatedStorageServer,
};
