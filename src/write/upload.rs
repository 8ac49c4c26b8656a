//! Async caller API for appendable uploads.

use crate::checksum::{ChunkSegment, StreamingSegmenter};
use crate::config::AppendConfig;
use crate::error::{StorageError, StorageResult};
use crate::retry::RetryContextProvider;
use crate::wire::{AppendObjectSpec, CallContext, ObjectMetadata, WriteObjectSpec};
use crate::write::state::{AppendUploadState, UploadState};
use crate::write::stream::{AppendStream, AppendTransport};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

/// Appends bytes to one object over a resumable bidi stream.
///
/// `write` segments input into checksummed chunks and waits while the
/// in-flight window is full. `finalize` seals the object; `close` ends the
/// upload but leaves the object appendable.
pub struct AppendableUpload {
    stream: Arc<AppendStream>,
    segmenter: StreamingSegmenter,
    flush_interval: u64,
    since_flush: u64,
    closed: bool,
}

impl AppendableUpload {
    /// Start an upload that creates a new appendable object.
    ///
    /// No stream is opened until the first segment is ready.
    pub fn new(
        transport: Arc<AppendTransport>,
        spec: WriteObjectSpec,
        ctx: CallContext,
        config: &AppendConfig,
        retry: &RetryContextProvider,
    ) -> StorageResult<Self> {
        config.validate()?;
        let state = AppendUploadState::new_object(
            spec,
            ctx,
            config.max_pending_bytes,
            config.chunking.checksum_enabled,
        );
        Self::with_state(transport, state, config, retry)
    }

    /// Resume appending to an existing object generation.
    ///
    /// Returns once the server has reported the persisted size.
    pub async fn takeover(
        transport: Arc<AppendTransport>,
        spec: AppendObjectSpec,
        ctx: CallContext,
        config: &AppendConfig,
        retry: &RetryContextProvider,
    ) -> StorageResult<Self> {
        config.validate()?;
        let state = AppendUploadState::takeover(
            spec,
            ctx,
            config.max_pending_bytes,
            config.chunking.checksum_enabled,
        );
        let upload = Self::with_state(transport, state, config, retry)?;
        upload.stream.begin_takeover()?;
        upload
            .wait_until(|s| s.state() == UploadState::Running)
            .await?;
        info!(
            persisted = upload.stream.total_sent_bytes(),
            "append takeover reconciled"
        );
        Ok(upload)
    }

    fn with_state(
        transport: Arc<AppendTransport>,
        state: AppendUploadState,
        config: &AppendConfig,
        retry: &RetryContextProvider,
    ) -> StorageResult<Self> {
        Ok(AppendableUpload {
            stream: AppendStream::new(transport, state, retry.create(), config.max_redirects),
            segmenter: StreamingSegmenter::from_config(&config.chunking)?,
            flush_interval: config.flush_interval_bytes,
            since_flush: 0,
            closed: false,
        })
    }

    pub fn stream(&self) -> &Arc<AppendStream> {
        &self.stream
    }

    /// Bytes the server has acknowledged as durable.
    pub fn persisted_size(&self) -> Option<u64> {
        self.stream.confirmed_bytes()
    }

    /// Bytes accepted by `write`, including any still held by the segmenter.
    pub fn written(&self) -> u64 {
        self.stream.total_sent_bytes() + self.segmenter.pending_len() as u64
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::IllegalState("Upload already closed".to_string()));
        }
        Ok(())
    }

    pub async fn write(&mut self, data: Bytes) -> StorageResult<usize> {
        self.check_open()?;
        let len = data.len();
        for segment in self.segmenter.push(data) {
            self.offer(segment).await?;
        }
        if self.flush_interval > 0 && self.since_flush >= self.flush_interval {
            debug!(since_flush = self.since_flush, "periodic flush");
            self.stream.flush()?;
            self.since_flush = 0;
        }
        Ok(len)
    }

    /// Send everything written so far and wait until it is persisted.
    pub async fn flush(&mut self) -> StorageResult<u64> {
        self.check_open()?;
        self.drain_tail().await?;
        self.stream.flush()?;
        self.since_flush = 0;
        let target = self.stream.total_sent_bytes();
        self.wait_until(|s| s.confirmed_bytes().is_some_and(|c| c >= target))
            .await?;
        Ok(target)
    }

    /// Seal the object. The returned metadata carries the CRC32C of every
    /// byte appended by this upload.
    pub async fn finalize(mut self) -> StorageResult<ObjectMetadata> {
        self.check_open()?;
        self.closed = true;
        self.drain_tail().await?;
        let total = self.stream.total_sent_bytes();
        self.stream.finish_write(total)?;
        self.stream.result().await
    }

    /// Persist everything and stop, leaving the object appendable.
    pub async fn close(mut self) -> StorageResult<ObjectMetadata> {
        self.check_open()?;
        self.closed = true;
        self.drain_tail().await?;
        let total = self.stream.total_sent_bytes();
        self.stream.close_stream(total)?;
        self.stream.result().await
    }

    async fn drain_tail(&mut self) -> StorageResult<()> {
        for segment in self.segmenter.finish() {
            self.offer(segment).await?;
        }
        Ok(())
    }

    async fn offer(&mut self, segment: ChunkSegment) -> StorageResult<()> {
        let len = segment.len() as u64;
        let stream = self.stream.clone();
        loop {
            let notified = stream.progress().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stream.append(segment.clone())? {
                self.since_flush += len;
                return Ok(());
            }
            if let Some(Err(e)) = stream.try_result() {
                return Err(e);
            }
            // window full; ask for the acknowledgement that frees it
            stream.flush()?;
            self.since_flush = 0;
            notified.await;
        }
    }

    async fn wait_until(&self, done: impl Fn(&AppendUploadState) -> bool) -> StorageResult<()> {
        let stream = self.stream.clone();
        loop {
            let notified = stream.progress().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if stream.inspect(&done) {
                return Ok(());
            }
            match stream.try_result() {
                Some(Err(e)) => return Err(e),
                Some(Ok(_)) => {
                    return Err(StorageError::IllegalState(
                        "Upload already complete".to_string(),
                    ))
                }
                None => {}
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for AppendableUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendableUpload")
            .field("state", &self.stream.upload_state())
            .field("written", &self.written())
            .field("closed", &self.closed)
            .finish()
    }
}
