//! One physical bidi read stream and its restart/redirect state machine.
//!
//! ## States
//!
//! ```text
//!            send()                    on_error / on_complete
//!   IDLE ─────────────► ACTIVE ──────────────────────────────► IDLE
//!    ▲                    │                                     │
//!    │                    │ close()                             │ retry continuation
//!    │                    ▼                                     │ or redirect
//!    │                 CLOSED ◄──────── close() ─────────────── │
//!    └──────────────────────────── restart() ◄──────────────────┘
//! ```
//!
//! `IDLE` has no physical stream. `send` opens one lazily from the session's
//! open arguments; `restart` opens one only when some read is ready to send
//! or the session has not yet seen its first response.
//!
//! Every physical stream gets a new epoch. Callbacks from an older epoch are
//! ignored, so a late error from a replaced stream cannot tear down its
//! successor.
//!
//! The transport is opened and written to without holding the stream lock.
//! While an open is in flight, `send` queues its request for the new stream
//! and `restart` treats the stream as active.

use crate::checksum::{Crc32cValue, Hasher};
use crate::completion::{Completion, SharedResult};
use crate::error::{StorageError, StorageResult};
use crate::read::op::StreamRead;
use crate::read::state::ReadSessionState;
use crate::retry::RetryContext;
use crate::transport::{BidiTransport, RequestStream, ResponseObserver};
use crate::wire::{CallContext, ObjectMetadata, ObjectRangeData, ReadObjectRequest, ReadObjectResponse};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub type ReadTransport = dyn BidiTransport<ReadObjectRequest, ReadObjectResponse>;

struct StreamInner {
    request_stream: Option<Arc<dyn RequestStream<ReadObjectRequest>>>,
    /// Epoch of a stream being opened outside the lock
    opening: Option<u64>,
    /// Sent while `opening`; flushed once that stream is installed
    queued: Vec<ReadObjectRequest>,
    epoch: u64,
    open: bool,
    redirects: u32,
}

pub struct ReadSessionStream {
    me: Weak<ReadSessionStream>,
    transport: Arc<ReadTransport>,
    state: Arc<ReadSessionState>,
    retry: RetryContext,
    hasher: Hasher,
    max_redirects: u32,
    inner: Mutex<StreamInner>,
    resolved: Completion<ObjectMetadata>,
}

impl ReadSessionStream {
    pub fn new(
        transport: Arc<ReadTransport>,
        state: Arc<ReadSessionState>,
        retry: RetryContext,
        hasher: Hasher,
        max_redirects: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ReadSessionStream {
            me: me.clone(),
            transport,
            state,
            retry,
            hasher,
            max_redirects,
            inner: Mutex::new(StreamInner {
                request_stream: None,
                opening: None,
                queued: Vec::new(),
                epoch: 0,
                open: true,
                redirects: 0,
            }),
            resolved: Completion::new(),
        })
    }

    pub fn state(&self) -> &Arc<ReadSessionState> {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// A physical stream is currently established.
    pub fn is_active(&self) -> bool {
        self.inner.lock().request_stream.is_some()
    }

    /// Resolves with the object metadata from the first response.
    pub fn resolved(&self) -> SharedResult<ObjectMetadata> {
        self.resolved.future()
    }

    pub fn send(&self, request: ReadObjectRequest) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(StorageError::stream_closed());
        }
        if let Some(stream) = inner.request_stream.clone() {
            drop(inner);
            return stream.send(request);
        }
        if inner.opening.is_some() {
            inner.queued.push(request);
            return Ok(());
        }

        let args = self.state.open_arguments();
        let mut merged = args.request;
        let present: HashSet<u64> = merged.read_ranges.iter().map(|r| r.read_id).collect();
        let extra = ReadObjectRequest {
            read_object_spec: request.read_object_spec,
            read_ranges: request
                .read_ranges
                .into_iter()
                .filter(|r| !present.contains(&r.read_id))
                .collect(),
        };
        merged.merge_from(extra);
        self.open_stream(inner, args.ctx, merged)
    }

    /// Re-establish the physical stream after a failure.
    ///
    /// Fails if a stream is already active. Transmits nothing when every read
    /// is backing off and the session is already resolved.
    pub fn restart(&self) -> StorageResult<()> {
        self.restart_inner(true)
    }

    fn restart_inner(&self, strict: bool) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.open {
            return Err(StorageError::stream_closed());
        }
        if inner.request_stream.is_some() || inner.opening.is_some() {
            if strict {
                return Err(StorageError::IllegalState(
                    "attempting to restart stream when stream is already active".to_string(),
                ));
            }
            return Ok(());
        }
        let args = self.state.open_arguments();
        if args.request.read_ranges.is_empty() && self.state.is_resolved() {
            debug!("restart skipped, no read ready to send");
            return Ok(());
        }
        debug!(ranges = args.request.read_ranges.len(), "restarting read stream");
        self.open_stream(inner, args.ctx, args.request)
    }

    /// Reserve a new epoch, open and write the first request unlocked, then
    /// install the stream unless it was superseded meanwhile.
    fn open_stream(
        &self,
        mut inner: MutexGuard<'_, StreamInner>,
        ctx: CallContext,
        request: ReadObjectRequest,
    ) -> StorageResult<()> {
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.opening = Some(epoch);
        drop(inner);

        let sent_ids: HashSet<u64> = request.read_ranges.iter().map(|r| r.read_id).collect();
        let observer = Arc::new(StreamObserver {
            stream: self.me.clone(),
            epoch,
        });
        let opened = self.transport.open(ctx, observer).and_then(|stream| {
            let stream: Arc<dyn RequestStream<ReadObjectRequest>> = Arc::from(stream);
            match stream.send(request) {
                Ok(()) => Ok(stream),
                Err(e) => {
                    stream.close_send();
                    Err(e)
                }
            }
        });

        let mut inner = self.inner.lock();
        let ours = inner.opening == Some(epoch);
        if ours {
            inner.opening = None;
        }
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                if ours {
                    inner.queued.clear();
                }
                return Err(e);
            }
        };
        if !ours || !inner.open || inner.epoch != epoch {
            let closed = !inner.open;
            drop(inner);
            debug!(epoch, "read stream superseded while opening");
            stream.close_send();
            return if closed {
                Err(StorageError::stream_closed())
            } else {
                Ok(())
            };
        }
        inner.request_stream = Some(stream.clone());
        let queued = std::mem::take(&mut inner.queued);
        drop(inner);
        debug!(epoch, queued = queued.len(), "read stream opened");

        for mut request in queued {
            request.read_ranges.retain(|r| !sent_ids.contains(&r.read_id));
            if !request.read_ranges.is_empty() {
                stream.send(request)?;
            }
        }
        Ok(())
    }

    /// Half-close the physical stream and refuse further sends.
    ///
    /// Outstanding reads are left as they are; failing them is the owner's job.
    pub fn close(&self) {
        let stream = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return;
            }
            inner.open = false;
            inner.opening = None;
            inner.queued.clear();
            inner.request_stream.take()
        };
        if let Some(stream) = stream {
            stream.close_send();
        }
        self.retry.reset();
        self.resolved
            .complete(Err(StorageError::cancelled("Stream closed before first response")));
        debug!("read stream closed");
    }

    /// Fail every outstanding read and the pending resolution.
    pub fn fail_all(&self, error: StorageError) {
        let failed = self.state.fail_all(|| error.clone());
        self.resolved.complete(Err(error.clone()));
        if failed > 0 {
            warn!(failed, error = %error, "failing outstanding reads");
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.open
            && inner.epoch == epoch
            && (inner.request_stream.is_some() || inner.opening == Some(epoch))
    }

    fn on_response(&self, epoch: u64, response: ReadObjectResponse) {
        {
            let mut inner = self.inner.lock();
            let current = inner.request_stream.is_some() || inner.opening == Some(epoch);
            if !inner.open || inner.epoch != epoch || !current {
                return;
            }
            inner.redirects = 0;
        }
        self.retry.reset();

        if let Some(metadata) = response.metadata {
            self.state.set_metadata(metadata.clone());
            if self.resolved.complete(Ok(metadata)) {
                debug!("read session resolved");
            }
        }
        if let Some(handle) = response.read_handle {
            self.state.set_read_handle(handle);
        }
        for data in response.object_data_ranges {
            self.apply_range_data(data);
        }
    }

    fn apply_range_data(&self, data: ObjectRangeData) {
        let id = data.read_range.read_id;
        let Some(read) = self.state.get_outstanding_read(id) else {
            return;
        };
        if !read.accepting_bytes() {
            return;
        }

        let content = data.checksummed_data.content;
        if let Some(crc) = data.checksummed_data.crc32c {
            if let Err(e) = self.hasher.validate(Crc32cValue::of(crc), &content) {
                self.record_read_error(&read, e);
                return;
            }
        }

        let position = read.read_offset();
        let begin = data.read_range.read_offset;
        if begin < position {
            let skip = (position - begin) as usize;
            if skip < content.len() {
                read.accept(content.slice(skip..));
            }
            if read.is_satisfied() {
                read.eof();
                self.state.remove_outstanding_read_if(id, &read);
                return;
            }
            self.record_read_error(
                &read,
                StorageError::out_of_range(format!(
                    "position = {}, readRange.read_offset = {}",
                    position, begin
                )),
            );
            return;
        }
        if begin > position {
            self.record_read_error(
                &read,
                StorageError::out_of_range(format!(
                    "position = {}, readRange.read_offset = {}",
                    position, begin
                )),
            );
            return;
        }

        read.accept(content);
        if data.range_end {
            read.eof();
            self.state.remove_outstanding_read_if(id, &read);
            debug!(read_id = id, offset = read.read_offset(), "read complete");
        }
    }

    fn record_read_error(&self, read: &Arc<StreamRead>, error: StorageError) {
        let weak = self.me.clone();
        let to_restart = read.clone();
        let state = self.state.clone();
        let to_fail = read.clone();
        read.record_error(
            error,
            Box::new(move || {
                if let Some(stream) = weak.upgrade() {
                    stream.restart_read(&to_restart);
                }
            }),
            Box::new(move |e| {
                state.remove_outstanding_read_if(to_fail.read_id(), &to_fail);
                warn!(read_id = to_fail.read_id(), error = %e, "read failed");
                to_fail.fail(e);
            }),
        );
    }

    /// Resend one read from its current offset under a new id.
    fn restart_read(&self, read: &Arc<StreamRead>) {
        if !read.accepting_bytes() {
            return;
        }
        let Ok(read) = self.state.assign_new_read_id(read.read_id()) else {
            return;
        };
        let request = ReadObjectRequest {
            read_object_spec: None,
            read_ranges: vec![read.make_read_range()],
        };
        debug!(read_id = read.read_id(), offset = read.read_offset(), "restarting read");
        if let Err(e) = self.send(request) {
            if self.is_open() {
                self.handle_stream_error(e);
            }
        }
    }

    fn on_error(&self, epoch: u64, error: StorageError) {
        {
            let mut inner = self.inner.lock();
            if !inner.open || inner.epoch != epoch {
                return;
            }
            inner.request_stream = None;
            inner.opening = None;
            inner.queued.clear();
        }
        self.handle_stream_error(error);
    }

    fn on_complete(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.request_stream = None;
            inner.opening = None;
            inner.queued.clear();
        }
        if !self.state.is_resolved() {
            self.handle_stream_error(StorageError::unavailable("onComplete without prior onNext"));
        } else if self.state.outstanding_count() > 0 {
            self.handle_stream_error(StorageError::unavailable(
                "stream completed with reads outstanding",
            ));
        }
    }

    fn handle_stream_error(&self, error: StorageError) {
        let error = match error {
            StorageError::ReadRedirected {
                routing_token,
                read_handle,
            } => {
                let redirects = {
                    let mut inner = self.inner.lock();
                    inner.redirects += 1;
                    inner.redirects
                };
                if redirects <= self.max_redirects {
                    debug!(redirects, ?routing_token, "following read redirect");
                    self.state.set_routing_token(routing_token);
                    if let Some(handle) = read_handle {
                        self.state.set_read_handle(handle);
                    }
                    self.restart_quietly();
                    return;
                }
                StorageError::ReadRedirected {
                    routing_token,
                    read_handle,
                }
            }
            StorageError::ReadRangeErrors { errors, .. } => {
                for e in errors {
                    if let Some(read) = self.state.remove_outstanding_read(e.read_id) {
                        read.pre_fail();
                        warn!(read_id = e.read_id, code = %e.code, "read rejected by server");
                        read.fail(StorageError::status(e.code, e.message));
                    }
                }
                StorageError::aborted(
                    "Stream error, reclassifying as ABORTED for reads not specified in BidiReadObjectError",
                )
            }
            other => other,
        };

        let restart = self.me.clone();
        let fail = self.me.clone();
        self.retry.record_error(
            error,
            Box::new(move || {
                if let Some(stream) = restart.upgrade() {
                    stream.restart_quietly();
                }
            }),
            Box::new(move |e| {
                if let Some(stream) = fail.upgrade() {
                    stream.fail_all(e);
                }
            }),
        );
    }

    fn restart_quietly(&self) {
        if let Err(e) = self.restart_inner(false) {
            if self.is_open() {
                self.handle_stream_error(e);
            }
        }
    }
}

struct StreamObserver {
    stream: Weak<ReadSessionStream>,
    epoch: u64,
}

impl ResponseObserver<ReadObjectResponse> for StreamObserver {
    fn on_response(&self, response: ReadObjectResponse) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_response(self.epoch, response);
        }
    }

    fn on_error(&self, error: StorageError) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_error(self.epoch, error);
        }
    }

    fn on_complete(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.on_complete(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc32cLengthKnown;
    use crate::clock::SimulatedClock;
    use crate::config::RetrySettings;
    use crate::error::{Code, ReadRangeError};
    use crate::read::range::RangeSpec;
    use crate::retry::{DefaultRetryPolicy, ManualScheduler, RetryContextProvider};
    use crate::wire::{ChecksummedData, ReadObjectSpec, ReadRange, REQUEST_PARAMS_HEADER};
    use bytes::Bytes;
    use futures::FutureExt;

    /// Records opened streams; tests drive the observers by hand.
    #[derive(Default)]
    struct ScriptedTransport {
        opened: Mutex<Vec<Opened>>,
    }

    struct Opened {
        ctx: CallContext,
        observer: Arc<dyn ResponseObserver<ReadObjectResponse>>,
        sent: Arc<Mutex<Vec<ReadObjectRequest>>>,
    }

    struct ScriptedStream {
        sent: Arc<Mutex<Vec<ReadObjectRequest>>>,
    }

    impl RequestStream<ReadObjectRequest> for ScriptedStream {
        fn send(&self, request: ReadObjectRequest) -> StorageResult<()> {
            self.sent.lock().push(request);
            Ok(())
        }
        fn close_send(&self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    impl BidiTransport<ReadObjectRequest, ReadObjectResponse> for ScriptedTransport {
        fn open(
            &self,
            ctx: CallContext,
            observer: Arc<dyn ResponseObserver<ReadObjectResponse>>,
        ) -> StorageResult<Box<dyn RequestStream<ReadObjectRequest>>> {
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.opened.lock().push(Opened {
                ctx,
                observer,
                sent: sent.clone(),
            });
            Ok(Box::new(ScriptedStream { sent }))
        }
    }

    impl ScriptedTransport {
        fn opens(&self) -> usize {
            self.opened.lock().len()
        }

        fn observer(&self, i: usize) -> Arc<dyn ResponseObserver<ReadObjectResponse>> {
            self.opened.lock()[i].observer.clone()
        }

        fn sent(&self, i: usize) -> Vec<ReadObjectRequest> {
            self.opened.lock()[i].sent.lock().clone()
        }

        fn header(&self, i: usize) -> Option<String> {
            self.opened.lock()[i]
                .ctx
                .header(REQUEST_PARAMS_HEADER)
                .map(str::to_string)
        }
    }

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        scheduler: Arc<ManualScheduler>,
        provider: RetryContextProvider,
        stream: Arc<ReadSessionStream>,
    }

    const OBJECT: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    fn fixture() -> Fixture {
        let clock = SimulatedClock::new(0);
        let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
        let provider = RetryContextProvider::new(
            &RetrySettings::test(),
            scheduler.clone(),
            Arc::new(DefaultRetryPolicy),
            Arc::new(clock),
        )
        .unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let stream = session_stream(transport.clone(), &provider);
        Fixture {
            transport,
            scheduler,
            provider,
            stream,
        }
    }

    fn session_stream(
        transport: Arc<ReadTransport>,
        provider: &RetryContextProvider,
    ) -> Arc<ReadSessionStream> {
        let state = Arc::new(ReadSessionState::new(
            CallContext::default(),
            ReadObjectRequest {
                read_object_spec: Some(ReadObjectSpec {
                    bucket: "b".into(),
                    object: "o".into(),
                    ..Default::default()
                }),
                read_ranges: vec![],
            },
        ));
        ReadSessionStream::new(transport, state, provider.create(), Hasher::Enabled, 3)
    }

    type OnOpen = Box<dyn FnOnce(&Arc<ReadSessionStream>) + Send>;

    /// Calls back into the stream from inside `open`, the way an inline
    /// transport delivers responses before `open` returns.
    #[derive(Default)]
    struct ReentrantTransport {
        scripted: ScriptedTransport,
        stream: Mutex<Weak<ReadSessionStream>>,
        on_open: Mutex<Option<OnOpen>>,
    }

    impl BidiTransport<ReadObjectRequest, ReadObjectResponse> for ReentrantTransport {
        fn open(
            &self,
            ctx: CallContext,
            observer: Arc<dyn ResponseObserver<ReadObjectResponse>>,
        ) -> StorageResult<Box<dyn RequestStream<ReadObjectRequest>>> {
            let opened = self.scripted.open(ctx, observer.clone())?;
            let stream = self.stream.lock().upgrade();
            let hook = self.on_open.lock().take();
            if let (Some(stream), Some(hook)) = (stream, hook) {
                hook(&stream);
            }
            observer.on_response(ReadObjectResponse {
                metadata: Some(metadata()),
                ..Default::default()
            });
            Ok(opened)
        }
    }

    fn metadata() -> ObjectMetadata {
        ObjectMetadata {
            bucket: "b".into(),
            name: "o".into(),
            generation: 7,
            size: OBJECT.len() as u64,
            ..Default::default()
        }
    }

    fn chunk(read_id: u64, offset: u64, len: usize, range_end: bool) -> ObjectRangeData {
        let content = Bytes::copy_from_slice(&OBJECT[offset as usize..offset as usize + len]);
        ObjectRangeData {
            checksummed_data: ChecksummedData {
                crc32c: Some(Crc32cLengthKnown::of_bytes(&content).value()),
                content,
            },
            read_range: ReadRange {
                read_offset: offset,
                read_length: len as u64,
                read_id,
            },
            range_end,
        }
    }

    impl Fixture {
        fn open(&self) {
            self.stream.send(ReadObjectRequest::default()).unwrap();
            self.transport.observer(0).on_response(ReadObjectResponse {
                metadata: Some(metadata()),
                ..Default::default()
            });
        }

        fn add_read(&self, begin: u64, len: u64) -> (Arc<StreamRead>, crate::read::ReadFuture) {
            let state = self.stream.state();
            let id = state.new_read_id();
            let (read, handle) = StreamRead::accumulating(
                id,
                RangeSpec::begin_at(begin).with_limit(len),
                self.provider.create(),
            );
            state.put_outstanding_read(id, read.clone());
            self.stream
                .send(ReadObjectRequest {
                    read_object_spec: None,
                    read_ranges: vec![read.make_read_range()],
                })
                .unwrap();
            (read, handle)
        }
    }

    #[test]
    fn test_first_send_opens_with_spec_and_header() {
        let fx = fixture();
        fx.open();
        assert_eq!(fx.transport.opens(), 1);
        assert_eq!(fx.transport.header(0).as_deref(), Some("bucket=b"));
        let first = &fx.transport.sent(0)[0];
        assert_eq!(first.read_object_spec.as_ref().unwrap().object, "o");
        assert_eq!(
            fx.stream.resolved().now_or_never().unwrap().unwrap().generation,
            7
        );
    }

    #[test]
    fn test_chunks_accumulate_and_complete() {
        let fx = fixture();
        fx.open();
        let (read, handle) = fx.add_read(4, 10);
        let id = read.read_id();
        fx.transport.observer(0).on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(id, 4, 6, false), chunk(id, 10, 4, true)],
            ..Default::default()
        });
        assert_eq!(&handle.now_or_never().unwrap().unwrap()[..], &OBJECT[4..14]);
        assert_eq!(fx.stream.state().outstanding_count(), 0);
    }

    #[test]
    fn test_restart_while_active_is_illegal() {
        let fx = fixture();
        fx.open();
        let err = fx.stream.restart().unwrap_err();
        assert!(err.to_string().contains("already active"));
    }

    #[test]
    fn test_error_restarts_with_remaining_ranges() {
        let fx = fixture();
        fx.open();
        let (read, handle) = fx.add_read(0, 20);
        let id = read.read_id();
        fx.transport.observer(0).on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(id, 0, 8, false)],
            ..Default::default()
        });
        fx.transport
            .observer(0)
            .on_error(StorageError::unavailable("connection reset"));
        assert!(!fx.stream.is_active());

        fx.scheduler.run_until_idle(10);
        assert_eq!(fx.transport.opens(), 2);
        let resume = &fx.transport.sent(1)[0];
        assert_eq!(resume.read_object_spec.as_ref().unwrap().generation, Some(7));
        assert_eq!(
            resume.read_ranges,
            vec![ReadRange {
                read_offset: 8,
                read_length: 12,
                read_id: id
            }]
        );

        fx.transport.observer(1).on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(id, 8, 12, true)],
            ..Default::default()
        });
        assert_eq!(&handle.now_or_never().unwrap().unwrap()[..], &OBJECT[..20]);
    }

    #[test]
    fn test_stale_epoch_callbacks_ignored() {
        let fx = fixture();
        fx.open();
        let stale = fx.transport.observer(0);
        stale.on_error(StorageError::unavailable("x"));
        fx.scheduler.run_until_idle(10);
        // resolved and nothing outstanding: restart is a no-op
        assert_eq!(fx.transport.opens(), 1);

        let (_read, _h) = fx.add_read(0, 4);
        assert_eq!(fx.transport.opens(), 2);
        stale.on_error(StorageError::unavailable("late"));
        assert!(fx.stream.is_active());
    }

    #[test]
    fn test_redirect_updates_token_and_restarts() {
        let fx = fixture();
        fx.open();
        let (_read, _h) = fx.add_read(0, 4);
        fx.transport.observer(0).on_error(StorageError::ReadRedirected {
            routing_token: Some("route-1".into()),
            read_handle: Some(Bytes::from_static(b"h")),
        });
        // immediate, no backoff
        assert_eq!(fx.transport.opens(), 2);
        assert_eq!(
            fx.transport.header(1).as_deref(),
            Some("bucket=b&routing_token=route-1")
        );
        let spec = fx.transport.sent(1)[0].read_object_spec.clone().unwrap();
        assert_eq!(spec.read_handle.as_deref(), Some(&b"h"[..]));
    }

    #[test]
    fn test_redirect_limit_falls_back_to_retry() {
        let fx = fixture();
        fx.open();
        let (_read, _h) = fx.add_read(0, 4);
        for i in 0..3 {
            fx.transport.observer(i).on_error(StorageError::ReadRedirected {
                routing_token: Some(format!("r{}", i)),
                read_handle: None,
            });
        }
        assert_eq!(fx.transport.opens(), 4);
        fx.transport.observer(3).on_error(StorageError::ReadRedirected {
            routing_token: Some("r3".into()),
            read_handle: None,
        });
        assert_eq!(fx.transport.opens(), 4, "fourth redirect waits for backoff");
        fx.scheduler.run_until_idle(10);
        assert_eq!(fx.transport.opens(), 5);
    }

    #[test]
    fn test_restart_sends_only_reads_out_of_backoff() {
        let fx = fixture();
        fx.open();
        let (a, _ha) = fx.add_read(0, 4);
        let (b, _hb) = fx.add_read(10, 4);
        for read in [&a, &b] {
            read.record_error(StorageError::unavailable("slow"), Box::new(|| {}), Box::new(|_| {}));
            assert!(read.retry_context().in_backoff());
        }
        fx.transport
            .observer(0)
            .on_error(StorageError::unavailable("connection reset"));
        assert!(!fx.stream.is_active());

        fx.stream.restart().unwrap();
        assert_eq!(fx.transport.opens(), 1, "every read is backing off");
        assert!(!fx.stream.is_active());

        a.retry_context().reset();
        fx.stream.restart().unwrap();
        assert_eq!(fx.transport.opens(), 2);
        let sent = fx.transport.sent(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].read_ranges, vec![a.make_read_range()]);
        assert!(sent[0].read_ranges.iter().all(|r| r.read_id != b.read_id()));
    }

    #[test]
    fn test_transport_may_call_back_while_opening() {
        let fx = fixture();
        let transport = Arc::new(ReentrantTransport::default());
        let stream = session_stream(transport.clone(), &fx.provider);
        *transport.stream.lock() = Arc::downgrade(&stream);

        let state = stream.state().clone();
        let first_id = state.new_read_id();
        let (first, first_handle) = StreamRead::accumulating(
            first_id,
            RangeSpec::begin_at(0).with_limit(4),
            fx.provider.create(),
        );
        state.put_outstanding_read(first_id, first.clone());

        let first_range = first.make_read_range();
        let provider = fx.provider.clone();
        let (late_tx, late_rx) = std::sync::mpsc::channel();
        *transport.on_open.lock() = Some(Box::new(move |stream: &Arc<ReadSessionStream>| {
            let state = stream.state();
            let id = state.new_read_id();
            let (late, handle) =
                StreamRead::accumulating(id, RangeSpec::begin_at(10).with_limit(4), provider.create());
            state.put_outstanding_read(id, late.clone());
            // already part of the opening request; must not be sent twice
            stream.send(ReadObjectRequest {
                read_object_spec: None,
                read_ranges: vec![first_range],
            })
            .unwrap();
            stream.send(ReadObjectRequest {
                read_object_spec: None,
                read_ranges: vec![late.make_read_range()],
            })
            .unwrap();
            late_tx.send((late, handle)).unwrap();
        }));

        stream.send(ReadObjectRequest::default()).unwrap();
        let (late, late_handle) = late_rx.recv().unwrap();

        assert_eq!(transport.scripted.opens(), 1);
        assert!(stream.is_active());
        assert_eq!(stream.resolved().now_or_never().unwrap().unwrap().generation, 7);
        let sent = transport.scripted.sent(0);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].read_ranges, vec![first.make_read_range()]);
        assert_eq!(sent[1].read_ranges, vec![late.make_read_range()]);

        transport.scripted.observer(0).on_response(ReadObjectResponse {
            object_data_ranges: vec![
                chunk(first.read_id(), 0, 4, true),
                chunk(late.read_id(), 10, 4, true),
            ],
            ..Default::default()
        });
        assert_eq!(&first_handle.now_or_never().unwrap().unwrap()[..], &OBJECT[..4]);
        assert_eq!(&late_handle.now_or_never().unwrap().unwrap()[..], &OBJECT[10..14]);
    }

    #[test]
    fn test_range_errors_fail_named_reads_only() {
        let fx = fixture();
        fx.open();
        let (bad, bad_handle) = fx.add_read(0, 4);
        let (good, _good_handle) = fx.add_read(10, 4);
        fx.transport.observer(0).on_error(StorageError::ReadRangeErrors {
            message: "bad range".into(),
            errors: vec![ReadRangeError {
                read_id: bad.read_id(),
                code: Code::OutOfRange,
                message: "nope".into(),
            }],
        });
        let err = bad_handle.now_or_never().unwrap().unwrap_err();
        assert_eq!(err.code(), Code::OutOfRange);
        assert!(!good.is_finished());

        fx.scheduler.run_until_idle(10);
        let resume = &fx.transport.sent(1)[0];
        assert_eq!(resume.read_ranges.len(), 1);
        assert_eq!(resume.read_ranges[0].read_id, good.read_id());
    }

    #[test]
    fn test_overlapping_chunk_accepts_tail_and_restarts_read() {
        let fx = fixture();
        fx.open();
        let (read, handle) = fx.add_read(0, 12);
        let old_id = read.read_id();
        let observer = fx.transport.observer(0);
        observer.on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(old_id, 0, 6, false)],
            ..Default::default()
        });
        // server resends from 4: bytes 6..8 are new
        observer.on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(old_id, 4, 4, false)],
            ..Default::default()
        });
        assert_eq!(read.read_offset(), 8);

        fx.scheduler.run_until_idle(10);
        let new_id = read.read_id();
        assert_ne!(new_id, old_id);
        let resent = fx.transport.sent(0).last().cloned().unwrap();
        assert_eq!(resent.read_ranges[0].read_offset, 8);
        assert_eq!(resent.read_ranges[0].read_length, 4);

        observer.on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(new_id, 8, 4, true)],
            ..Default::default()
        });
        assert_eq!(&handle.now_or_never().unwrap().unwrap()[..], &OBJECT[..12]);
    }

    #[test]
    fn test_overlapping_chunk_reaching_limit_completes_read() {
        let fx = fixture();
        fx.open();
        let (read, handle) = fx.add_read(0, 8);
        let observer = fx.transport.observer(0);
        observer.on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(read.read_id(), 0, 6, false)],
            ..Default::default()
        });
        observer.on_response(ReadObjectResponse {
            object_data_ranges: vec![chunk(read.read_id(), 4, 4, false)],
            ..Default::default()
        });
        assert_eq!(fx.scheduler.pending(), 0, "nothing left to re-request");
        assert_eq!(&handle.now_or_never().unwrap().unwrap()[..], &OBJECT[..8]);
    }

    #[test]
    fn test_checksum_mismatch_fails_read() {
        let fx = fixture();
        fx.open();
        let (read, handle) = fx.add_read(0, 4);
        let mut bad = chunk(read.read_id(), 0, 4, true);
        bad.checksummed_data.crc32c = bad.checksummed_data.crc32c.map(|c| c ^ 0xFF);
        fx.transport.observer(0).on_response(ReadObjectResponse {
            object_data_ranges: vec![bad],
            ..Default::default()
        });
        let err = handle.now_or_never().unwrap().unwrap_err();
        assert_eq!(err.root_cause().code(), Code::DataLoss);
        assert_eq!(fx.stream.state().outstanding_count(), 0);
    }

    #[test]
    fn test_complete_without_response_retries() {
        let fx = fixture();
        fx.stream.send(ReadObjectRequest::default()).unwrap();
        fx.transport.observer(0).on_complete();
        assert!(!fx.stream.is_active());
        fx.scheduler.run_until_idle(10);
        assert_eq!(fx.transport.opens(), 2, "unresolved session reopens even with no reads");
    }

    #[test]
    fn test_close_does_not_fail_reads() {
        let fx = fixture();
        fx.open();
        let (read, _h) = fx.add_read(0, 4);
        fx.stream.close();
        assert!(!read.is_finished());
        let err = fx.stream.send(ReadObjectRequest::default()).unwrap_err();
        assert_eq!(err.to_string(), "illegal state: Stream closed");
        assert!(fx.stream.restart().is_err());
    }
}
