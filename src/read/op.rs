//! A single logical read multiplexed onto a session stream.
//!
//! Two delivery capabilities:
//!
//! - **Accumulating**: chunks are collected and one future resolves with all
//!   bytes on end-of-range
//! - **Streaming**: chunks are forwarded in order over a channel as they arrive
//!
//! Each read owns its `RetryContext`; a failure on one read never consumes
//! another read's budget.

use crate::completion::{Completion, SharedResult};
use crate::error::{StorageError, StorageResult};
use crate::read::range::RangeSpec;
use crate::retry::{OnFailure, OnSuccess, RetryContext};
use crate::wire::ReadRange;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Accumulating,
    Streaming,
}

enum Sink {
    Accumulating {
        chunks: Vec<Bytes>,
        completion: Arc<Completion<Bytes>>,
    },
    Streaming {
        tx: Option<mpsc::UnboundedSender<StorageResult<Bytes>>>,
    },
}

struct ReadInner {
    read_id: u64,
    offset: u64,
    tombstoned: bool,
    closed: bool,
    finished: bool,
    sink: Sink,
    on_close: Vec<OnClose>,
}

pub struct StreamRead {
    kind: ReadKind,
    range: RangeSpec,
    retry: RetryContext,
    inner: Mutex<ReadInner>,
}

impl StreamRead {
    pub fn accumulating(read_id: u64, range: RangeSpec, retry: RetryContext) -> (Arc<Self>, ReadFuture) {
        let completion = Arc::new(Completion::new());
        let future = completion.future();
        let read = Arc::new(Self::new(
            ReadKind::Accumulating,
            read_id,
            range,
            retry,
            Sink::Accumulating {
                chunks: Vec::new(),
                completion,
            },
        ));
        let handle = ReadFuture {
            read: Some(read.clone()),
            future,
        };
        (read, handle)
    }

    pub fn streaming(read_id: u64, range: RangeSpec, retry: RetryContext) -> (Arc<Self>, ReadStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let read = Arc::new(Self::new(
            ReadKind::Streaming,
            read_id,
            range,
            retry,
            Sink::Streaming { tx: Some(tx) },
        ));
        let handle = ReadStream {
            read: read.clone(),
            rx,
        };
        (read, handle)
    }

    fn new(kind: ReadKind, read_id: u64, range: RangeSpec, retry: RetryContext, sink: Sink) -> Self {
        StreamRead {
            kind,
            range,
            retry,
            inner: Mutex::new(ReadInner {
                read_id,
                offset: range.begin(),
                tombstoned: false,
                closed: false,
                finished: false,
                sink,
                on_close: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> ReadKind {
        self.kind
    }

    pub fn range(&self) -> RangeSpec {
        self.range
    }

    pub fn read_id(&self) -> u64 {
        self.inner.lock().read_id
    }

    /// Absolute object offset of the next expected byte.
    pub fn read_offset(&self) -> u64 {
        self.inner.lock().offset
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn accepting_bytes(&self) -> bool {
        let inner = self.inner.lock();
        !inner.tombstoned && !inner.closed && !inner.finished
    }

    /// Not tombstoned, not closed, not waiting out a backoff.
    pub fn ready_to_send(&self) -> bool {
        {
            let inner = self.inner.lock();
            if inner.tombstoned || inner.closed || inner.finished {
                return false;
            }
        }
        !self.retry.in_backoff()
    }

    /// True once a limited read has received every byte it asked for.
    pub fn is_satisfied(&self) -> bool {
        let inner = self.inner.lock();
        self.range
            .limit()
            .is_some_and(|limit| inner.offset - self.range.begin() >= limit)
    }

    pub fn can_share_stream_with(&self, other: &StreamRead) -> bool {
        self.kind == other.kind
    }

    /// Resume request for the bytes still outstanding.
    pub fn make_read_range(&self) -> ReadRange {
        let inner = self.inner.lock();
        let read_so_far = inner.offset - self.range.begin();
        ReadRange {
            read_offset: inner.offset,
            read_length: self
                .range
                .limit()
                .map(|limit| limit.saturating_sub(read_so_far))
                .unwrap_or(0),
            read_id: inner.read_id,
        }
    }

    pub(crate) fn set_read_id(&self, read_id: u64) {
        self.inner.lock().read_id = read_id;
    }

    pub fn accept(&self, bytes: Bytes) {
        self.retry.reset();
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        inner.offset += bytes.len() as u64;
        match &mut inner.sink {
            Sink::Accumulating { chunks, .. } => chunks.push(bytes),
            Sink::Streaming { tx } => {
                if let Some(tx) = tx {
                    // receiver gone means the caller stopped reading
                    let _ = tx.send(Ok(bytes));
                }
            }
        }
    }

    pub fn eof(&self) {
        self.retry.reset();
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            match &mut inner.sink {
                Sink::Accumulating { chunks, completion } => {
                    let bytes = join(std::mem::take(chunks));
                    completion.complete(Ok(bytes));
                }
                Sink::Streaming { tx } => {
                    tx.take();
                }
            }
            std::mem::take(&mut inner.on_close)
        };
        run_all(callbacks);
    }

    /// Mark the read as about to fail so it is excluded from resends.
    pub fn pre_fail(&self) {
        self.inner.lock().tombstoned = true;
    }

    pub fn fail(&self, error: StorageError) {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.tombstoned = true;
            if inner.finished {
                return;
            }
            inner.finished = true;
            match &mut inner.sink {
                Sink::Accumulating { chunks, completion } => {
                    chunks.clear();
                    completion.complete(Err(error));
                }
                Sink::Streaming { tx } => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Err(error));
                    }
                }
            }
            std::mem::take(&mut inner.on_close)
        };
        run_all(callbacks);
    }

    /// Caller-side release; the read stops accepting bytes.
    pub fn close(&self) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.on_close)
        };
        self.retry.reset();
        run_all(callbacks);
    }

    /// Register a callback run once when the read finishes or is closed.
    pub fn add_on_close(&self, callback: OnClose) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.finished || inner.closed {
                Some(callback)
            } else {
                inner.on_close.push(callback);
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }

    pub fn record_error(&self, error: StorageError, on_success: OnSuccess, on_failure: OnFailure) {
        self.retry.record_error(error, on_success, on_failure);
    }

    pub fn retry_context(&self) -> &RetryContext {
        &self.retry
    }
}

impl std::fmt::Debug for StreamRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamRead")
            .field("kind", &self.kind)
            .field("read_id", &inner.read_id)
            .field("offset", &inner.offset)
            .field("range", &self.range)
            .field("tombstoned", &inner.tombstoned)
            .field("finished", &inner.finished)
            .finish()
    }
}

fn join(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let total = chunks.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for c in &chunks {
                buf.extend_from_slice(c);
            }
            buf.freeze()
        }
    }
}

fn run_all(callbacks: Vec<OnClose>) {
    for cb in callbacks {
        cb();
    }
}

/// Caller handle of an accumulating read.
pub struct ReadFuture {
    read: Option<Arc<StreamRead>>,
    future: SharedResult<Bytes>,
}

impl ReadFuture {
    /// Already-resolved handle, used for empty ranges.
    pub(crate) fn ready(result: StorageResult<Bytes>) -> Self {
        let completion = Completion::new();
        completion.complete(result);
        ReadFuture {
            read: None,
            future: completion.future(),
        }
    }

    /// `None` for ranges resolved without touching the stream.
    pub fn read_id(&self) -> Option<u64> {
        self.read.as_ref().map(|r| r.read_id())
    }

    pub fn is_done(&self) -> bool {
        self.read.as_ref().map_or(true, |r| r.is_finished())
    }

    /// Fail the read with a cancellation if it has not finished.
    pub fn cancel(&self) {
        if let Some(read) = &self.read {
            read.fail(StorageError::cancelled("Read cancelled"));
        }
    }
}

impl Future for ReadFuture {
    type Output = StorageResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}

/// Caller handle of a streaming read. Dropping it closes the read.
pub struct ReadStream {
    read: Arc<StreamRead>,
    rx: mpsc::UnboundedReceiver<StorageResult<Bytes>>,
}

impl ReadStream {
    pub fn read_id(&self) -> u64 {
        self.read.read_id()
    }

    /// Drain the stream into one buffer.
    pub async fn collect_bytes(mut self) -> StorageResult<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            chunks.push(chunk?);
        }
        Ok(join(chunks))
    }
}

impl Stream for ReadStream {
    type Item = StorageResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.read.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn range(begin: u64, limit: u64) -> RangeSpec {
        RangeSpec::begin_at(begin).with_limit(limit)
    }

    #[test]
    fn test_make_read_range_tracks_progress() {
        let (read, _handle) = StreamRead::accumulating(7, range(100, 50), RetryContext::never_retry());
        assert_eq!(
            read.make_read_range(),
            ReadRange {
                read_offset: 100,
                read_length: 50,
                read_id: 7
            }
        );
        read.accept(Bytes::from_static(&[0; 20]));
        assert_eq!(
            read.make_read_range(),
            ReadRange {
                read_offset: 120,
                read_length: 30,
                read_id: 7
            }
        );

        let (unbounded, _h) =
            StreamRead::accumulating(8, RangeSpec::begin_at(5), RetryContext::never_retry());
        assert_eq!(unbounded.make_read_range().read_length, 0);
    }

    #[test]
    fn test_accumulating_resolves_on_eof() {
        let (read, handle) = StreamRead::accumulating(1, range(0, 6), RetryContext::never_retry());
        read.accept(Bytes::from_static(b"abc"));
        read.accept(Bytes::from_static(b"def"));
        assert!(read.accepting_bytes());
        read.eof();
        assert!(!read.accepting_bytes());
        assert!(handle.is_done());
        let bytes = handle.now_or_never().unwrap().unwrap();
        assert_eq!(&bytes[..], b"abcdef");
    }

    #[test]
    fn test_fail_resolves_once() {
        let (read, handle) = StreamRead::accumulating(1, range(0, 6), RetryContext::never_retry());
        read.fail(StorageError::unavailable("first"));
        read.fail(StorageError::unavailable("second"));
        read.eof();
        let err = handle.now_or_never().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "UNAVAILABLE: first");
        assert!(!read.ready_to_send());
    }

    #[tokio::test]
    async fn test_streaming_delivers_in_order() {
        let (read, mut handle) = StreamRead::streaming(3, RangeSpec::all(), RetryContext::never_retry());
        read.accept(Bytes::from_static(b"one"));
        read.accept(Bytes::from_static(b"two"));
        read.eof();
        assert_eq!(&handle.next().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&handle.next().await.unwrap().unwrap()[..], b"two");
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_streaming_failure_surfaces_error() {
        let (read, handle) = StreamRead::streaming(3, RangeSpec::all(), RetryContext::never_retry());
        read.accept(Bytes::from_static(b"partial"));
        read.fail(StorageError::DataLoss("bad".into()));
        let err = handle.collect_bytes().await.unwrap_err();
        assert!(matches!(err, StorageError::DataLoss(_)));
    }

    #[test]
    fn test_dropping_stream_closes_read() {
        let (read, handle) = StreamRead::streaming(3, RangeSpec::all(), RetryContext::never_retry());
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        read.add_on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        drop(handle);
        assert!(!read.accepting_bytes());
        assert!(!read.ready_to_send());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // late registration runs immediately
        let c = closed.clone();
        read.add_on_close(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sharing_requires_same_kind() {
        let (a, _ha) = StreamRead::accumulating(1, RangeSpec::all(), RetryContext::never_retry());
        let (b, _hb) = StreamRead::accumulating(2, RangeSpec::all(), RetryContext::never_retry());
        let (s, _hs) = StreamRead::streaming(3, RangeSpec::all(), RetryContext::never_retry());
        assert!(a.can_share_stream_with(&b));
        assert!(!a.can_share_stream_with(&s));
        assert!(!s.can_share_stream_with(&a));
    }

    #[test]
    fn test_ready_future() {
        let handle = ReadFuture::ready(Ok(Bytes::new()));
        assert!(handle.is_done());
        assert!(handle.now_or_never().unwrap().unwrap().is_empty());
    }
}
