//! Deterministic simulation testing for read sessions and appendable uploads.
//!
//! Each harness drives the real protocol engine against a
//! `SimulatedStorageServer` with a `ManualScheduler` and `SimulatedClock`,
//! so every retry, redirect and fault is reproducible from the seed.
//!
//! ## Design
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = ReadDstHarness::new(ReadDstConfig::chaos(seed));
//!     harness.run(200);          // random reads interleaved with delivery
//!     harness.check_invariants(); // quiesce, then verify every read
//! }
//! ```
//!
//! Invariants:
//! - every read resolves exactly once
//! - a successful read returns exactly the object bytes of its range
//! - failures only surface for faults that cannot be retried away
//! - a finished upload matches, byte for byte and by CRC32C, what was written

use crate::checksum::{ChunkSegment, StreamingSegmenter};
use crate::clock::SimulatedClock;
use crate::config::{AppendConfig, ReadSessionConfig, RetrySettings};
use crate::error::{Code, StorageError, StorageResult};
use crate::read::{ObjectReadSession, RangeSpec, ReadFuture, ReadStream, ReadTransport};
use crate::retry::{DefaultRetryPolicy, ManualScheduler, RetryContextProvider};
use crate::simulator::server::{SimulatedServerConfig, SimulatedServerStats, SimulatedStorageServer};
use crate::simulator::DeterministicRng;
use crate::wire::{AppendObjectSpec, CallContext, ObjectMetadata, ReadObjectSpec, WriteObjectSpec};
use crate::write::{AppendStream, AppendTransport, AppendUploadState, UploadState};
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "dst-bucket";

/// Steps allowed while quiescing before a run is declared stuck.
const QUIESCE_LIMIT: usize = 100_000;

fn provider(
    settings: &RetrySettings,
    scheduler: &Arc<ManualScheduler>,
    clock: &SimulatedClock,
) -> StorageResult<RetryContextProvider> {
    RetryContextProvider::new(
        settings,
        scheduler.clone(),
        Arc::new(DefaultRetryPolicy),
        Arc::new(clock.clone()),
    )
}

/// A retry budget ran out.
fn is_budget_exhausted(error: &StorageError) -> bool {
    error.is_cancelled() && error.to_string().contains("budget")
}

/// Deliver events and run due retries until neither makes progress.
/// Returns false if the limit was hit first.
fn quiesce(server: &SimulatedStorageServer, scheduler: &ManualScheduler, done: impl Fn() -> bool) -> bool {
    for _ in 0..QUIESCE_LIMIT {
        if done() {
            return true;
        }
        if server.pump() {
            continue;
        }
        if scheduler.run_due() > 0 {
            continue;
        }
        if scheduler.run_until_idle(1) == 0 {
            return done() || server.pending_events() == 0;
        }
    }
    false
}

// ===========================================================================
// Read sessions
// ===========================================================================

#[derive(Debug, Clone)]
pub struct ReadDstConfig {
    pub seed: u64,
    pub server: SimulatedServerConfig,
    pub object_size: usize,
    /// Probability a new read is streaming rather than accumulating
    pub streaming_probability: f64,
    /// Probability of issuing a read (vs delivering events or advancing time)
    pub read_probability: f64,
    /// Probability of closing the session and opening a fresh one
    pub reopen_probability: f64,
    pub max_events_per_step: usize,
    pub retry: RetrySettings,
    pub session: ReadSessionConfig,
}

impl Default for ReadDstConfig {
    fn default() -> Self {
        ReadDstConfig {
            seed: 0,
            server: SimulatedServerConfig::default(),
            object_size: 1024,
            streaming_probability: 0.3,
            read_probability: 0.3,
            reopen_probability: 0.01,
            max_events_per_step: 8,
            retry: RetrySettings::test(),
            session: ReadSessionConfig::default(),
        }
    }
}

impl ReadDstConfig {
    pub fn new(seed: u64) -> Self {
        ReadDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults
    pub fn calm(seed: u64) -> Self {
        ReadDstConfig {
            seed,
            server: SimulatedServerConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        ReadDstConfig {
            seed,
            server: SimulatedServerConfig::default(),
            ..Default::default()
        }
    }

    pub fn chaos(seed: u64) -> Self {
        ReadDstConfig {
            seed,
            server: SimulatedServerConfig::high_chaos(),
            reopen_probability: 0.03,
            ..Default::default()
        }
    }

    /// A read may fail when its failure cannot be retried away.
    fn failure_expected(&self, error: &StorageError) -> bool {
        match error.root_cause() {
            StorageError::DataLoss(_) => self.server.corrupt_crc_prob > 0.0,
            StorageError::Status {
                code: Code::FailedPrecondition,
                ..
            } => self.server.range_error_prob > 0.0,
            _ => is_budget_exhausted(error) && self.server.stream_drop_prob > 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReadOperation {
    ReadRange { begin: u64, limit: Option<u64> },
    ReadStream { begin: u64, limit: Option<u64> },
    Deliver { events: usize },
    AdvanceTime { ms: u64 },
    Reopen,
}

#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Issued { read: usize },
    Delivered { events: usize, retries: usize },
    Advanced { retries: usize },
    Reopened { abandoned: usize },
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct RecordedReadOperation {
    pub id: u64,
    pub operation: ReadOperation,
    pub outcome: ReadOutcome,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReadDstResult {
    pub seed: u64,
    pub total_operations: u64,
    pub reads_issued: u64,
    pub reads_succeeded: u64,
    pub reads_failed: u64,
    pub reads_abandoned: u64,
    pub bytes_verified: u64,
    pub reopens: u64,
    pub server_stats: SimulatedServerStats,
    pub invariant_violations: Vec<String>,
    pub history: Vec<RecordedReadOperation>,
}

impl ReadDstResult {
    pub fn new(seed: u64) -> Self {
        ReadDstResult {
            seed,
            total_operations: 0,
            reads_issued: 0,
            reads_succeeded: 0,
            reads_failed: 0,
            reads_abandoned: 0,
            bytes_verified: 0,
            reopens: 0,
            server_stats: SimulatedServerStats::default(),
            invariant_violations: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops, {} reads ({} ok, {} failed, {} abandoned), {} bytes verified, {} reopens, {} violations",
            self.seed,
            self.total_operations,
            self.reads_issued,
            self.reads_succeeded,
            self.reads_failed,
            self.reads_abandoned,
            self.bytes_verified,
            self.reopens,
            self.invariant_violations.len()
        )
    }
}

enum ReadHandle {
    Accumulating(Option<ReadFuture>),
    Streaming {
        stream: ReadStream,
        received: BytesMut,
        ended: bool,
    },
}

struct TrackedRead {
    index: usize,
    expected: Bytes,
    handle: ReadHandle,
    /// The session was closed while this read was outstanding
    abandoned: bool,
    outcome: Option<StorageResult<Bytes>>,
}

impl TrackedRead {
    /// Collect whatever the read has produced so far.
    fn poll(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        match &mut self.handle {
            ReadHandle::Accumulating(slot) => {
                let Some(future) = slot.as_mut() else {
                    return;
                };
                if let Some(result) = future.now_or_never() {
                    self.outcome = Some(result);
                    *slot = None;
                }
            }
            ReadHandle::Streaming {
                stream,
                received,
                ended,
            } => {
                while !*ended {
                    match stream.next().now_or_never() {
                        Some(Some(Ok(chunk))) => received.extend_from_slice(&chunk),
                        Some(Some(Err(e))) => {
                            *ended = true;
                            self.outcome = Some(Err(e));
                        }
                        Some(None) => {
                            *ended = true;
                            self.outcome = Some(Ok(received.clone().freeze()));
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// A finished stream must stay finished.
    fn stream_reopened(&mut self) -> bool {
        match &mut self.handle {
            ReadHandle::Streaming {
                stream,
                ended: true,
                ..
            } => matches!(stream.next().now_or_never(), Some(Some(_))),
            _ => false,
        }
    }
}

pub struct ReadDstHarness {
    config: ReadDstConfig,
    rng: DeterministicRng,
    clock: SimulatedClock,
    scheduler: Arc<ManualScheduler>,
    server: SimulatedStorageServer,
    provider: Option<RetryContextProvider>,
    object: Bytes,
    session: Option<ObjectReadSession>,
    reads: Vec<TrackedRead>,
    result: ReadDstResult,
}

impl ReadDstHarness {
    pub fn new(config: ReadDstConfig) -> Self {
        let mut rng = DeterministicRng::new(config.seed);
        let server = SimulatedStorageServer::new(rng.next_u64(), config.server.clone());
        let object = rng.gen_bytes(config.object_size);
        server.insert_object(BUCKET, "object", object.clone());

        let clock = SimulatedClock::new(0);
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let mut result = ReadDstResult::new(config.seed);
        let provider = provider(&config.retry, &scheduler, &clock)
            .map_err(|e| result.invariant_violations.push(format!("retry settings rejected: {}", e)))
            .ok();

        let mut harness = ReadDstHarness {
            config,
            rng,
            clock,
            scheduler,
            server,
            provider,
            object,
            session: None,
            reads: Vec::new(),
            result,
        };
        harness.open_session();
        harness
    }

    fn open_session(&mut self) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        let transport: Arc<ReadTransport> = self.server.read_transport();
        let spec = ReadObjectSpec {
            bucket: BUCKET.to_string(),
            object: "object".to_string(),
            ..Default::default()
        };
        match ObjectReadSession::begin(
            transport,
            spec,
            CallContext::default(),
            &self.config.session,
            provider,
        ) {
            Ok(session) => self.session = Some(session),
            Err(e) => self
                .result
                .invariant_violations
                .push(format!("session failed to begin: {}", e)),
        }
    }

    fn next_operation(&mut self) -> ReadOperation {
        let roll = self.rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
        let size = self.object.len() as u64;
        if roll < self.config.reopen_probability {
            return ReadOperation::Reopen;
        }
        if roll < self.config.reopen_probability + self.config.read_probability {
            let begin = self.rng.gen_range(0, size + 1);
            let limit = if self.rng.gen_bool(0.2) {
                None
            } else {
                Some(self.rng.gen_range(0, size / 2 + 1))
            };
            return if self.rng.gen_bool(self.config.streaming_probability) {
                ReadOperation::ReadStream { begin, limit }
            } else {
                ReadOperation::ReadRange { begin, limit }
            };
        }
        if self.rng.gen_bool(0.8) {
            ReadOperation::Deliver {
                events: self.rng.gen_range(1, self.config.max_events_per_step as u64 + 1) as usize,
            }
        } else {
            ReadOperation::AdvanceTime {
                ms: self.rng.gen_range(1, 250),
            }
        }
    }

    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.execute_operation(op);
        }
    }

    fn execute_operation(&mut self, op: ReadOperation) {
        self.result.total_operations += 1;
        let id = self.result.total_operations;

        let outcome = match &op {
            ReadOperation::ReadRange { begin, limit } => self.issue(*begin, *limit, false),
            ReadOperation::ReadStream { begin, limit } => self.issue(*begin, *limit, true),
            ReadOperation::Deliver { events } => {
                let events = self.server.pump_all(*events);
                let retries = self.scheduler.run_due();
                ReadOutcome::Delivered { events, retries }
            }
            ReadOperation::AdvanceTime { ms } => ReadOutcome::Advanced {
                retries: self.scheduler.advance(Duration::from_millis(*ms)),
            },
            ReadOperation::Reopen => self.reopen(),
        };
        for read in &mut self.reads {
            read.poll();
        }

        self.result.history.push(RecordedReadOperation {
            id,
            operation: op,
            outcome,
            timestamp_ms: self.clock.current_ms(),
        });
    }

    fn issue(&mut self, begin: u64, limit: Option<u64>, streaming: bool) -> ReadOutcome {
        let Some(session) = &self.session else {
            return ReadOutcome::Rejected("no session".to_string());
        };
        let range = match limit {
            Some(limit) => RangeSpec::begin_at(begin).with_limit(limit),
            None => RangeSpec::begin_at(begin),
        };
        let handle = if streaming {
            session.read_stream(range).map(|stream| ReadHandle::Streaming {
                stream,
                received: BytesMut::new(),
                ended: false,
            })
        } else {
            session
                .read_range(range)
                .map(|future| ReadHandle::Accumulating(Some(future)))
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => return ReadOutcome::Rejected(e.to_string()),
        };

        let size = self.object.len();
        let start = (begin as usize).min(size);
        let end = match limit {
            Some(limit) => start.saturating_add(limit as usize).min(size),
            None => size,
        };
        let index = self.reads.len();
        self.reads.push(TrackedRead {
            index,
            expected: self.object.slice(start..end),
            handle,
            abandoned: false,
            outcome: None,
        });
        self.result.reads_issued += 1;
        ReadOutcome::Issued { read: index }
    }

    fn reopen(&mut self) -> ReadOutcome {
        let mut abandoned = 0;
        for read in &mut self.reads {
            read.poll();
            if read.outcome.is_none() {
                read.abandoned = true;
                abandoned += 1;
            }
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.result.reopens += 1;
        self.open_session();
        ReadOutcome::Reopened { abandoned }
    }

    /// Quiesce, then verify every read issued during the run.
    pub fn check_invariants(&mut self) {
        let scheduler = self.scheduler.clone();
        if !quiesce(&self.server, &scheduler, || false) {
            self.result
                .invariant_violations
                .push("simulation did not quiesce".to_string());
        }

        for read in &mut self.reads {
            read.poll();
            if read.stream_reopened() {
                self.result
                    .invariant_violations
                    .push(format!("read {} produced data after it ended", read.index));
            }
            match &read.outcome {
                None => {
                    self.result
                        .invariant_violations
                        .push(format!("read {} never resolved", read.index));
                }
                Some(Ok(bytes)) => {
                    if bytes != &read.expected {
                        self.result.invariant_violations.push(format!(
                            "read {} returned {} bytes that differ from the expected {}",
                            read.index,
                            bytes.len(),
                            read.expected.len()
                        ));
                    } else {
                        self.result.reads_succeeded += 1;
                        self.result.bytes_verified += bytes.len() as u64;
                    }
                }
                Some(Err(e)) => {
                    if read.abandoned && e.to_string().contains("Parent stream shutdown") {
                        self.result.reads_abandoned += 1;
                    } else if self.config.failure_expected(e) {
                        self.result.reads_failed += 1;
                    } else {
                        self.result
                            .invariant_violations
                            .push(format!("read {} failed unexpectedly: {}", read.index, e));
                    }
                }
            }
        }

        if let Some(session) = &self.session {
            match session.metadata() {
                Some(meta) if meta.size != self.object.len() as u64 => {
                    self.result.invariant_violations.push(format!(
                        "session resolved size {} but object has {}",
                        meta.size,
                        self.object.len()
                    ));
                }
                _ => {}
            }
        }
        self.result.server_stats = self.server.stats();
    }

    pub fn result(&self) -> &ReadDstResult {
        &self.result
    }

    pub fn into_result(mut self) -> ReadDstResult {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.result
    }
}

pub fn run_read_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> ReadDstConfig,
) -> Vec<ReadDstResult> {
    (0..count)
        .map(|i| {
            let mut harness = ReadDstHarness::new(config_fn(base_seed + i as u64));
            harness.run(ops_per_run);
            harness.check_invariants();
            harness.into_result()
        })
        .collect()
}

// ===========================================================================
// Appendable uploads
// ===========================================================================

#[derive(Debug, Clone)]
pub struct AppendDstConfig {
    pub seed: u64,
    pub server: SimulatedServerConfig,
    pub append: AppendConfig,
    pub max_write_bytes: usize,
    pub flush_probability: f64,
    /// Probability of finalizing; otherwise the upload is closed and a
    /// takeover appends the rest before finalizing
    pub finalize_probability: f64,
    pub max_events_per_step: usize,
    pub retry: RetrySettings,
}

impl Default for AppendDstConfig {
    fn default() -> Self {
        AppendDstConfig {
            seed: 0,
            // corrupt and range faults only apply to reads
            server: SimulatedServerConfig::default().recoverable_only(),
            append: AppendConfig::test(),
            max_write_bytes: 100,
            flush_probability: 0.1,
            finalize_probability: 0.5,
            max_events_per_step: 8,
            retry: RetrySettings::test(),
        }
    }
}

impl AppendDstConfig {
    pub fn new(seed: u64) -> Self {
        AppendDstConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn calm(seed: u64) -> Self {
        AppendDstConfig {
            seed,
            server: SimulatedServerConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn moderate(seed: u64) -> Self {
        AppendDstConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn chaos(seed: u64) -> Self {
        AppendDstConfig {
            seed,
            server: SimulatedServerConfig::high_chaos().recoverable_only(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppendOperation {
    Write { len: usize },
    Flush,
    Deliver { events: usize },
    AdvanceTime { ms: u64 },
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Accepted { queued_segments: usize },
    Flushed,
    Delivered { events: usize, retries: usize },
    Advanced { retries: usize },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecordedAppendOperation {
    pub id: u64,
    pub operation: AppendOperation,
    pub outcome: AppendOutcome,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppendDstResult {
    pub seed: u64,
    pub total_operations: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub takeovers: u64,
    pub finalized: bool,
    /// The upload gave up after its retry budget ran out
    pub exhausted: bool,
    pub final_metadata: Option<ObjectMetadata>,
    pub server_stats: SimulatedServerStats,
    pub invariant_violations: Vec<String>,
    pub history: Vec<RecordedAppendOperation>,
}

impl AppendDstResult {
    pub fn new(seed: u64) -> Self {
        AppendDstResult {
            seed,
            total_operations: 0,
            bytes_written: 0,
            flushes: 0,
            takeovers: 0,
            finalized: false,
            exhausted: false,
            final_metadata: None,
            server_stats: SimulatedServerStats::default(),
            invariant_violations: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops, {} bytes, {} flushes, {} takeovers, finalized={}, {} violations",
            self.seed,
            self.total_operations,
            self.bytes_written,
            self.flushes,
            self.takeovers,
            self.finalized,
            self.invariant_violations.len()
        )
    }
}

pub struct AppendDstHarness {
    config: AppendDstConfig,
    rng: DeterministicRng,
    clock: SimulatedClock,
    scheduler: Arc<ManualScheduler>,
    server: SimulatedStorageServer,
    provider: Option<RetryContextProvider>,
    stream: Option<Arc<AppendStream>>,
    segmenter: Option<StreamingSegmenter>,
    backlog: VecDeque<ChunkSegment>,
    /// Every byte accepted from the workload, in order
    written: BytesMut,
    result: AppendDstResult,
}

impl AppendDstHarness {
    pub fn new(config: AppendDstConfig) -> Self {
        let mut rng = DeterministicRng::new(config.seed);
        let server = SimulatedStorageServer::new(rng.next_u64(), config.server.clone());
        let clock = SimulatedClock::new(0);
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let mut result = AppendDstResult::new(config.seed);

        let provider = provider(&config.retry, &scheduler, &clock)
            .map_err(|e| result.invariant_violations.push(format!("retry settings rejected: {}", e)))
            .ok();
        let segmenter = StreamingSegmenter::from_config(&config.append.chunking)
            .map_err(|e| result.invariant_violations.push(format!("chunking rejected: {}", e)))
            .ok();

        let mut harness = AppendDstHarness {
            config,
            rng,
            clock,
            scheduler,
            server,
            provider,
            stream: None,
            segmenter,
            backlog: VecDeque::new(),
            written: BytesMut::new(),
            result,
        };
        let state = AppendUploadState::new_object(
            WriteObjectSpec {
                bucket: BUCKET.to_string(),
                object: "upload".to_string(),
                if_generation_match: None,
                appendable: true,
            },
            CallContext::default(),
            harness.config.append.max_pending_bytes,
            harness.config.append.chunking.checksum_enabled,
        );
        harness.stream = harness.new_stream(state);
        harness
    }

    fn new_stream(&self, state: AppendUploadState) -> Option<Arc<AppendStream>> {
        let provider = self.provider.as_ref()?;
        let transport: Arc<AppendTransport> = self.server.append_transport();
        Some(AppendStream::new(
            transport,
            state,
            provider.create(),
            self.config.append.max_redirects,
        ))
    }

    fn next_operation(&mut self) -> AppendOperation {
        let roll = self.rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
        if roll < self.config.flush_probability {
            AppendOperation::Flush
        } else if roll < 0.5 {
            AppendOperation::Write {
                len: self.rng.gen_range(1, self.config.max_write_bytes as u64 + 1) as usize,
            }
        } else if roll < 0.9 {
            AppendOperation::Deliver {
                events: self.rng.gen_range(1, self.config.max_events_per_step as u64 + 1) as usize,
            }
        } else {
            AppendOperation::AdvanceTime {
                ms: self.rng.gen_range(1, 250),
            }
        }
    }

    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.execute_operation(op);
        }
    }

    fn execute_operation(&mut self, op: AppendOperation) {
        self.result.total_operations += 1;
        let id = self.result.total_operations;

        let outcome = match &op {
            AppendOperation::Write { len } => self.execute_write(*len),
            AppendOperation::Flush => match &self.stream {
                Some(stream) => match stream.flush() {
                    Ok(()) => {
                        self.result.flushes += 1;
                        AppendOutcome::Flushed
                    }
                    Err(e) => AppendOutcome::Failed(e.to_string()),
                },
                None => AppendOutcome::Failed("no stream".to_string()),
            },
            AppendOperation::Deliver { events } => {
                let events = self.server.pump_all(*events);
                let retries = self.scheduler.run_due();
                self.offer_backlog();
                AppendOutcome::Delivered { events, retries }
            }
            AppendOperation::AdvanceTime { ms } => {
                let retries = self.scheduler.advance(Duration::from_millis(*ms));
                self.offer_backlog();
                AppendOutcome::Advanced { retries }
            }
        };
        self.check_acknowledged();

        self.result.history.push(RecordedAppendOperation {
            id,
            operation: op,
            outcome,
            timestamp_ms: self.clock.current_ms(),
        });
    }

    fn execute_write(&mut self, len: usize) -> AppendOutcome {
        let Some(segmenter) = self.segmenter.as_mut() else {
            return AppendOutcome::Failed("no segmenter".to_string());
        };
        let data = self.rng.gen_bytes(len);
        self.written.extend_from_slice(&data);
        self.result.bytes_written += len as u64;
        self.backlog.extend(segmenter.push(data));
        match self.offer_backlog() {
            Ok(()) => AppendOutcome::Accepted {
                queued_segments: self.backlog.len(),
            },
            Err(e) => AppendOutcome::Failed(e.to_string()),
        }
    }

    /// Hand queued segments to the stream until the window is full.
    fn offer_backlog(&mut self) -> StorageResult<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        while let Some(segment) = self.backlog.front() {
            if stream.append(segment.clone())? {
                self.backlog.pop_front();
            } else {
                stream.flush()?;
                break;
            }
        }
        Ok(())
    }

    /// Acknowledged bytes must already be durable on the server.
    fn check_acknowledged(&mut self) {
        let Some(stream) = &self.stream else {
            return;
        };
        let Some(confirmed) = stream.confirmed_bytes() else {
            return;
        };
        let persisted = self
            .server
            .object(BUCKET, "upload")
            .map_or(0, |(meta, _)| meta.size);
        if confirmed > persisted {
            self.result.invariant_violations.push(format!(
                "client confirmed {} bytes but server persisted {}",
                confirmed, persisted
            ));
        }
        if confirmed > stream.total_sent_bytes() {
            self.result.invariant_violations.push(format!(
                "confirmed {} exceeds total sent {}",
                confirmed,
                stream.total_sent_bytes()
            ));
        }
    }

    /// Push every remaining byte, quiescing as needed.
    fn drain_backlog(&mut self) -> bool {
        if let Some(segmenter) = self.segmenter.as_mut() {
            self.backlog.extend(segmenter.finish());
        }
        for _ in 0..QUIESCE_LIMIT {
            if let Err(e) = self.offer_backlog() {
                return self.record_failure(&e);
            }
            if self.backlog.is_empty() {
                return true;
            }
            if let Some(Err(e)) = self.stream.as_ref().and_then(|s| s.try_result()) {
                return self.record_failure(&e);
            }
            if !self.server.pump() && self.scheduler.run_due() == 0 && self.scheduler.run_until_idle(1) == 0 {
                break;
            }
        }
        self.result
            .invariant_violations
            .push(format!("{} segments never accepted", self.backlog.len()));
        false
    }

    /// True when the failure is an expected give-up.
    fn record_failure(&mut self, error: &StorageError) -> bool {
        if is_budget_exhausted(error) && self.config.server.stream_drop_prob > 0.0 {
            self.result.exhausted = true;
        } else {
            self.result
                .invariant_violations
                .push(format!("upload failed unexpectedly: {}", error));
        }
        false
    }

    fn await_result(&mut self) -> Option<ObjectMetadata> {
        let stream = self.stream.clone()?;
        let done = {
            let stream = stream.clone();
            move || stream.try_result().is_some()
        };
        if !quiesce(&self.server, &self.scheduler, done) {
            self.result
                .invariant_violations
                .push("upload did not quiesce".to_string());
        }
        match stream.try_result() {
            Some(Ok(meta)) => Some(meta),
            Some(Err(e)) => {
                self.record_failure(&e);
                None
            }
            None => {
                self.result
                    .invariant_violations
                    .push(format!("upload never resolved (state {})", stream.upload_state()));
                None
            }
        }
    }

    /// Resume the closed object with a takeover and append a tail.
    fn takeover(&mut self, closed: &ObjectMetadata) -> bool {
        self.result.takeovers += 1;
        let state = AppendUploadState::takeover(
            AppendObjectSpec {
                bucket: BUCKET.to_string(),
                object: "upload".to_string(),
                generation: closed.generation,
                write_handle: None,
                routing_token: None,
            },
            CallContext::default(),
            self.config.append.max_pending_bytes,
            self.config.append.chunking.checksum_enabled,
        );
        self.stream = self.new_stream(state);
        let Some(stream) = self.stream.clone() else {
            return false;
        };
        if let Err(e) = stream.begin_takeover() {
            return self.record_failure(&e);
        }
        let reconciled = {
            let stream = stream.clone();
            move || stream.upload_state() == UploadState::Running || stream.try_result().is_some()
        };
        quiesce(&self.server, &self.scheduler, reconciled);
        if let Some(Err(e)) = stream.try_result() {
            return self.record_failure(&e);
        }
        if stream.total_sent_bytes() != self.written.len() as u64 {
            self.result.invariant_violations.push(format!(
                "takeover learned {} persisted bytes, expected {}",
                stream.total_sent_bytes(),
                self.written.len()
            ));
            return false;
        }
        let tail_len = self.rng.gen_range(1, 200) as usize;
        let tail = self.rng.gen_bytes(tail_len);
        self.written.extend_from_slice(&tail);
        self.result.bytes_written += tail.len() as u64;
        if let Some(segmenter) = self.segmenter.as_mut() {
            self.backlog.extend(segmenter.push(tail));
        }
        self.drain_backlog()
    }

    fn finish(&mut self, finalize: bool) -> Option<ObjectMetadata> {
        let stream = self.stream.clone()?;
        let total = stream.total_sent_bytes();
        let offered = if finalize {
            stream.finish_write(total)
        } else {
            stream.close_stream(total)
        };
        match offered {
            Ok(true) => self.await_result(),
            Ok(false) => {
                self.result
                    .invariant_violations
                    .push("finishing request had no capacity".to_string());
                None
            }
            Err(e) => {
                self.record_failure(&e);
                None
            }
        }
    }

    /// Finish the upload and verify the object against what was written.
    pub fn check_invariants(&mut self) {
        self.result.server_stats = self.server.stats();
        if !self.drain_backlog() {
            return;
        }
        let finalize = self.rng.gen_bool(self.config.finalize_probability);
        if !finalize {
            let Some(closed) = self.finish(false) else {
                return;
            };
            if closed.finalized {
                self.result
                    .invariant_violations
                    .push("close finalized the object".to_string());
            }
            self.verify(&closed);
            if !self.takeover(&closed) {
                return;
            }
        }
        let Some(done) = self.finish(true) else {
            return;
        };
        self.result.finalized = done.finalized;
        if !done.finalized {
            self.result
                .invariant_violations
                .push("finish_write did not finalize the object".to_string());
        }
        self.verify(&done);
        self.result.final_metadata = Some(done);
        self.result.server_stats = self.server.stats();
    }

    fn verify(&mut self, meta: &ObjectMetadata) {
        let expected_crc = crc32c::crc32c(&self.written);
        if meta.size != self.written.len() as u64 {
            self.result.invariant_violations.push(format!(
                "upload reported {} bytes, wrote {}",
                meta.size,
                self.written.len()
            ));
        }
        if self.config.append.chunking.checksum_enabled && meta.crc32c != Some(expected_crc) {
            self.result.invariant_violations.push(format!(
                "upload reported crc32c {:?}, expected {}",
                meta.crc32c, expected_crc
            ));
        }
        match self.server.object(BUCKET, "upload") {
            Some((server_meta, bytes)) => {
                if bytes[..] != self.written[..] {
                    self.result.invariant_violations.push(format!(
                        "server holds {} bytes that differ from the {} written",
                        bytes.len(),
                        self.written.len()
                    ));
                }
                if server_meta.generation != meta.generation {
                    self.result.invariant_violations.push(format!(
                        "upload reported generation {} but server has {}",
                        meta.generation, server_meta.generation
                    ));
                }
            }
            None => self
                .result
                .invariant_violations
                .push("object missing on server".to_string()),
        }
    }

    pub fn result(&self) -> &AppendDstResult {
        &self.result
    }

    pub fn into_result(self) -> AppendDstResult {
        self.result
    }
}

pub fn run_append_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> AppendDstConfig,
) -> Vec<AppendDstResult> {
    (0..count)
        .map(|i| {
            let mut harness = AppendDstHarness::new(config_fn(base_seed + i as u64));
            harness.run(ops_per_run);
            harness.check_invariants();
            harness.into_result()
        })
        .collect()
}

// ===========================================================================
// Batch summaries
// ===========================================================================

/// Common view of a single run for batch reporting.
pub trait DstOutcome {
    fn seed(&self) -> u64;
    fn is_success(&self) -> bool;
    fn operations(&self) -> u64;
    fn stats(&self) -> &SimulatedServerStats;
}

impl DstOutcome for ReadDstResult {
    fn seed(&self) -> u64 {
        self.seed
    }
    fn is_success(&self) -> bool {
        ReadDstResult::is_success(self)
    }
    fn operations(&self) -> u64 {
        self.total_operations
    }
    fn stats(&self) -> &SimulatedServerStats {
        &self.server_stats
    }
}

impl DstOutcome for AppendDstResult {
    fn seed(&self) -> u64 {
        self.seed
    }
    fn is_success(&self) -> bool {
        AppendDstResult::is_success(self)
    }
    fn operations(&self) -> u64 {
        self.total_operations
    }
    fn stats(&self) -> &SimulatedServerStats {
        &self.server_stats
    }
}

pub fn summarize_batch<R: DstOutcome>(results: &[R]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed())
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.operations()).sum();
    let drops: u64 = results.iter().map(|r| r.stats().stream_drops).sum();
    let redirects: u64 = results.iter().map(|r| r.stats().redirects).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} stream drops, {} redirects",
        passed, total, total_ops, drops, redirects
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
