//! Caller-facing read session: many logical reads over shared streams.

use crate::checksum::Hasher;
use crate::config::ReadSessionConfig;
use crate::error::{StorageError, StorageResult};
use crate::read::op::{ReadFuture, ReadStream, StreamRead};
use crate::read::range::{get_read_cursor, RangeSpec};
use crate::read::state::ReadSessionState;
use crate::read::stream::{ReadSessionStream, ReadTransport};
use crate::retry::RetryContextProvider;
use crate::wire::{CallContext, ObjectMetadata, ReadObjectRequest, ReadObjectSpec};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

fn parent_shutdown() -> StorageError {
    StorageError::cancelled("Parent stream shutdown")
}

pub struct ObjectReadSession {
    transport: Arc<ReadTransport>,
    retry: RetryContextProvider,
    hasher: Hasher,
    max_redirects: u32,
    state: Arc<ReadSessionState>,
    stream: Arc<ReadSessionStream>,
    children: Arc<Mutex<Vec<Arc<ReadSessionStream>>>>,
    open: AtomicBool,
}

impl ObjectReadSession {
    /// Open the main stream without waiting for the first response.
    pub fn begin(
        transport: Arc<ReadTransport>,
        spec: ReadObjectSpec,
        ctx: CallContext,
        config: &ReadSessionConfig,
        retry: RetryContextProvider,
    ) -> StorageResult<Self> {
        let state = Arc::new(ReadSessionState::new(
            ctx,
            ReadObjectRequest {
                read_object_spec: Some(spec),
                read_ranges: Vec::new(),
            },
        ));
        let hasher = Hasher::new(config.checksum_validation);
        let stream = ReadSessionStream::new(
            transport.clone(),
            state.clone(),
            retry.create(),
            hasher,
            config.max_redirects,
        );
        stream.send(ReadObjectRequest::default())?;
        Ok(ObjectReadSession {
            transport,
            retry,
            hasher,
            max_redirects: config.max_redirects,
            state,
            stream,
            children: Arc::new(Mutex::new(Vec::new())),
            open: AtomicBool::new(true),
        })
    }

    /// Open the session and wait until the server describes the object.
    pub async fn open(
        transport: Arc<ReadTransport>,
        spec: ReadObjectSpec,
        ctx: CallContext,
        config: &ReadSessionConfig,
        retry: RetryContextProvider,
    ) -> StorageResult<Self> {
        let session = Self::begin(transport, spec, ctx, config, retry)?;
        let metadata = session.stream.resolved().await?;
        info!(
            bucket = %metadata.bucket,
            object = %metadata.name,
            generation = metadata.generation,
            size = metadata.size,
            "read session open"
        );
        Ok(session)
    }

    pub fn metadata(&self) -> Option<ObjectMetadata> {
        self.state.metadata()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Number of forked streams currently alive.
    pub fn child_streams(&self) -> usize {
        self.children.lock().len()
    }

    /// Read a range into a single buffer.
    pub fn read_range(&self, range: RangeSpec) -> StorageResult<ReadFuture> {
        let Some(range) = self.resolve(range)? else {
            return Ok(ReadFuture::ready(Ok(bytes::Bytes::new())));
        };
        let id = self.state.new_read_id();
        let (read, handle) = StreamRead::accumulating(id, range, self.retry.create());
        self.register(read)?;
        Ok(handle)
    }

    /// Read a range as an ordered stream of chunks.
    pub fn read_stream(&self, range: RangeSpec) -> StorageResult<ReadStream> {
        let resolved = self.resolve(range)?;
        let id = self.state.new_read_id();
        let (read, handle) =
            StreamRead::streaming(id, resolved.unwrap_or(range), self.retry.create());
        match resolved {
            Some(_) => self.register(read)?,
            None => read.eof(),
        }
        Ok(handle)
    }

    /// Clamp against the known object size. `None` for an empty range.
    fn resolve(&self, range: RangeSpec) -> StorageResult<Option<RangeSpec>> {
        if !self.is_open() {
            return Err(StorageError::IllegalState("Session already closed".to_string()));
        }
        let Some(metadata) = self.state.metadata() else {
            return Ok(Some(range));
        };
        let cursor = get_read_cursor(range, metadata.size)?;
        if !cursor.has_remaining() {
            return Ok(None);
        }
        Ok(Some(
            RangeSpec::begin_at(cursor.begin()).with_limit(cursor.remaining()),
        ))
    }

    fn register(&self, read: Arc<StreamRead>) -> StorageResult<()> {
        let request = ReadObjectRequest {
            read_object_spec: None,
            read_ranges: vec![read.make_read_range()],
        };
        if self.state.can_handle_new_read(&read) {
            self.state.put_outstanding_read(read.read_id(), read.clone());
            return send_or_fail(&self.stream, &read, request);
        }

        let child = ReadSessionStream::new(
            self.transport.clone(),
            Arc::new(self.state.fork_child()),
            self.retry.create(),
            self.hasher,
            self.max_redirects,
        );
        self.children.lock().push(child.clone());
        debug!(read_id = read.read_id(), kind = ?read.kind(), "read placed on child stream");

        let children = Arc::downgrade(&self.children);
        let owned = child.clone();
        read.add_on_close(Box::new(move || {
            if let Some(children) = children.upgrade() {
                children.lock().retain(|c| !Arc::ptr_eq(c, &owned));
            }
            owned.close();
        }));
        child.state().put_outstanding_read(read.read_id(), read.clone());
        send_or_fail(&child, &read, request)
    }

    /// Close every stream and fail the reads still outstanding.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in &children {
            child.close();
            child.state().fail_all(parent_shutdown);
        }
        self.stream.close();
        let failed = self.state.fail_all(parent_shutdown);
        info!(children = children.len(), failed, "read session closed");
    }
}

fn send_or_fail(
    stream: &ReadSessionStream,
    read: &Arc<StreamRead>,
    request: ReadObjectRequest,
) -> StorageResult<()> {
    if let Err(e) = stream.send(request) {
        stream.state().remove_outstanding_read_if(read.read_id(), read);
        read.fail(e.clone());
        return Err(e);
    }
    Ok(())
}

impl Drop for ObjectReadSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ObjectReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReadSession")
            .field("open", &self.is_open())
            .field("outstanding", &self.state.outstanding_count())
            .field("children", &self.child_streams())
            .finish()
    }
}
