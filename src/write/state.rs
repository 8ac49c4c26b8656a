//! Client-side state of one appendable upload.
//!
//! ## Request queue
//!
//! ```text
//!   queue:  [first?] [data@0] [data@64] [flush] [data@128] [finish]
//!            ▲                   ▲
//!            │                   └── last_sent
//!            └── evicted once the server confirms persisted_size
//! ```
//!
//! Every request stays queued until a response proves it durable, so after a
//! stream failure the unconfirmed tail can be replayed on a new stream. Data
//! requests count against `max_bytes`; non-data requests are free.
//!
//! ## Lifecycle
//!
//! ```text
//! Initializing ──► Running ◄──────────────┐
//!      │             │                    │ response
//!      │             ▼                    │
//!      └────► PendingRetry ──► Retrying ──┘
//! Takeover ──────────┘
//!                  any ──► TerminalSuccess | TerminalError
//! ```

use crate::checksum::{ChunkSegment, Crc32cLengthKnown};
use crate::error::{StorageError, StorageResult};
use crate::wire::{
    AppendObjectSpec, CallContext, ChecksummedData, FirstMessage, ObjectMetadata,
    WriteObjectRequest, WriteObjectResponse, WriteObjectSpec, REQUEST_PARAMS_HEADER,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Initializing,
    Takeover,
    Running,
    PendingRetry,
    Retrying,
    TerminalSuccess,
    TerminalError,
}

impl UploadState {
    const NON_TERMINAL: &'static [UploadState] = &[
        UploadState::Initializing,
        UploadState::Takeover,
        UploadState::Running,
        UploadState::PendingRetry,
        UploadState::Retrying,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::TerminalSuccess | UploadState::TerminalError)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Initializing => "INITIALIZING",
            UploadState::Takeover => "TAKEOVER",
            UploadState::Running => "RUNNING",
            UploadState::PendingRetry => "PENDING_RETRY",
            UploadState::Retrying => "RETRYING",
            UploadState::TerminalSuccess => "TERMINAL_SUCCESS",
            UploadState::TerminalError => "TERMINAL_ERROR",
        };
        f.write_str(s)
    }
}

/// Which object the upload targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Create a new appendable object
    New(WriteObjectSpec),
    /// Continue appending to an existing generation
    Takeover(AppendObjectSpec),
}

impl UploadTarget {
    fn bucket(&self) -> &str {
        match self {
            UploadTarget::New(spec) => &spec.bucket,
            UploadTarget::Takeover(spec) => &spec.bucket,
        }
    }
}

/// Merge two queued requests into one with the same meaning as sending
/// `first` then `second`.
pub fn concatenate(
    first: WriteObjectRequest,
    second: WriteObjectRequest,
) -> StorageResult<WriteObjectRequest> {
    if first.checksummed_data.is_some() && second.checksummed_data.is_some() {
        return Err(StorageError::InvalidArgument(
            "attempting to merge two requests that both specify checksummed_data".to_string(),
        ));
    }
    let write_offset = if first.checksummed_data.is_some() {
        let size = first.data_len();
        if first.write_offset + size != second.write_offset {
            return Err(StorageError::InvalidArgument(format!(
                "(leftWriteOffset + size == rightWriteOffset) ({} + {} == {})",
                first.write_offset, size, second.write_offset
            )));
        }
        first.write_offset
    } else {
        second.write_offset
    };

    let mut merged = WriteObjectRequest {
        first_message: second.first_message.or(first.first_message),
        write_offset,
        checksummed_data: second.checksummed_data.or(first.checksummed_data),
        flush: first.flush || second.flush,
        state_lookup: first.state_lookup || second.state_lookup,
        finish_write: first.finish_write || second.finish_write,
        object_checksums: second.object_checksums.or(first.object_checksums),
    };
    // finish_write implies flush and state_lookup
    if second.finish_write && (first.flush || first.state_lookup) {
        merged.flush = false;
        merged.state_lookup = false;
    }
    Ok(merged)
}

pub struct AppendUploadState {
    target: UploadTarget,
    base_ctx: CallContext,
    max_bytes: u64,
    queue: VecDeque<WriteObjectRequest>,
    enqueued_bytes: u64,
    last_sent: Option<usize>,
    min_byte_offset: u64,
    total_sent_bytes: u64,
    cumulative_crc32c: Option<Crc32cLengthKnown>,
    /// `None` until the server confirms the object exists
    confirmed_bytes: Option<u64>,
    generation: u64,
    write_handle: Option<Bytes>,
    routing_token: Option<String>,
    state: UploadState,
    return_after_retry: Option<UploadState>,
    last_resource: Option<ObjectMetadata>,
    final_flush_signaled: bool,
    final_flush_sent: bool,
    finish_write_signaled: bool,
    finish_write_sent: bool,
    last_ctx: Option<CallContext>,
}

impl AppendUploadState {
    /// Upload creating a new object. `checksummed` tracks a running CRC32C
    /// over every offered segment.
    pub fn new_object(
        spec: WriteObjectSpec,
        base_ctx: CallContext,
        max_bytes: u64,
        checksummed: bool,
    ) -> Self {
        Self::with_target(
            UploadTarget::New(spec),
            base_ctx,
            max_bytes,
            checksummed.then_some(Crc32cLengthKnown::ZERO),
            UploadState::Initializing,
        )
    }

    /// Upload resuming an existing generation. The persisted size and
    /// checksum are learned from the first response.
    pub fn takeover(
        spec: AppendObjectSpec,
        base_ctx: CallContext,
        max_bytes: u64,
        checksummed: bool,
    ) -> Self {
        let generation = spec.generation;
        let mut state = Self::with_target(
            UploadTarget::Takeover(spec),
            base_ctx,
            max_bytes,
            checksummed.then_some(Crc32cLengthKnown::ZERO),
            UploadState::Takeover,
        );
        state.generation = generation;
        state
    }

    fn with_target(
        target: UploadTarget,
        base_ctx: CallContext,
        max_bytes: u64,
        cumulative_crc32c: Option<Crc32cLengthKnown>,
        state: UploadState,
    ) -> Self {
        AppendUploadState {
            target,
            base_ctx,
            max_bytes,
            queue: VecDeque::new(),
            enqueued_bytes: 0,
            last_sent: None,
            min_byte_offset: 0,
            total_sent_bytes: 0,
            cumulative_crc32c,
            confirmed_bytes: None,
            generation: 0,
            write_handle: None,
            routing_token: None,
            state,
            return_after_retry: None,
            last_resource: None,
            final_flush_signaled: false,
            final_flush_sent: false,
            finish_write_signaled: false,
            finish_write_sent: false,
            last_ctx: None,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn cumulative_crc32c(&self) -> Option<Crc32cLengthKnown> {
        self.cumulative_crc32c
    }

    pub fn total_sent_bytes(&self) -> u64 {
        self.total_sent_bytes
    }

    pub fn confirmed_bytes(&self) -> Option<u64> {
        self.confirmed_bytes
    }

    pub fn available_capacity(&self) -> u64 {
        self.max_bytes.saturating_sub(self.enqueued_bytes)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn write_handle(&self) -> Option<&Bytes> {
        self.write_handle.as_ref()
    }

    pub fn routing_token(&self) -> Option<&str> {
        self.routing_token.as_deref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn peek_first(&self) -> Option<&WriteObjectRequest> {
        self.queue.front()
    }

    pub fn peek_last(&self) -> Option<&WriteObjectRequest> {
        self.queue.back()
    }

    /// `finish_write` was both enqueued and transmitted.
    pub fn is_finalizing(&self) -> bool {
        self.finish_write_signaled && self.finish_write_sent
    }

    fn validate_state(&self, allowed: &[UploadState]) -> StorageResult<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(StorageError::IllegalState(format!(
            "state mismatch. expected one of {:?} but is {}",
            allowed, self.state
        )))
    }

    fn check_not_finalizing(&self) -> StorageResult<()> {
        if self.finish_write_signaled {
            return Err(StorageError::IllegalState(
                "Attempting to append bytes even though finalization has previously been signaled."
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Enqueue one data segment at the current end of the upload.
    ///
    /// Returns `Ok(false)` when the segment does not fit in the remaining
    /// capacity; the caller retries after acknowledgements free space.
    pub fn offer_segment(&mut self, segment: ChunkSegment) -> StorageResult<bool> {
        self.validate_state(UploadState::NON_TERMINAL)?;
        self.check_not_finalizing()?;
        let size = segment.len() as u64;
        if size > self.available_capacity() {
            return Ok(false);
        }
        let crc = segment.crc32c();
        let next_crc = match (self.cumulative_crc32c, crc) {
            (None, _) => None,
            (Some(acc), Some(rhs)) => Some(acc.concat(rhs)),
            (Some(_), None) => {
                return Err(StorageError::IllegalState(
                    "segment is missing its crc32c while the upload is checksummed".to_string(),
                ))
            }
        };
        let request = WriteObjectRequest {
            write_offset: self.total_sent_bytes,
            checksummed_data: Some(ChecksummedData {
                content: segment.into_bytes(),
                crc32c: crc.map(|c| c.value()),
            }),
            ..Default::default()
        };
        let offered = self.internal_offer(request);
        if offered {
            self.cumulative_crc32c = next_crc;
        }
        Ok(offered)
    }

    /// Enqueue a non-data or pre-built request.
    pub fn offer(&mut self, request: WriteObjectRequest) -> StorageResult<bool> {
        self.validate_state(UploadState::NON_TERMINAL)?;
        if request.checksummed_data.is_some() {
            self.check_not_finalizing()?;
        }
        if request.data_len() > self.available_capacity() {
            return Ok(false);
        }
        if request.first_message.is_none() && request.write_offset != self.total_sent_bytes {
            return Err(StorageError::InvalidArgument(format!(
                "(write_offset == totalSentBytes) ({} == {})",
                request.write_offset, self.total_sent_bytes
            )));
        }
        Ok(self.internal_offer(request))
    }

    /// `flush + state_lookup` at the current end of the upload.
    pub fn flush_request(&self) -> WriteObjectRequest {
        WriteObjectRequest {
            write_offset: self.total_sent_bytes,
            flush: true,
            state_lookup: true,
            ..Default::default()
        }
    }

    /// `finish_write` carrying the whole-object checksum when tracked.
    pub fn finish_write_request(&self, length: u64) -> WriteObjectRequest {
        WriteObjectRequest {
            write_offset: length,
            finish_write: true,
            object_checksums: self.cumulative_crc32c.map(|c| c.value()),
            ..Default::default()
        }
    }

    /// Enqueue the flush that ends the upload without finalizing the object.
    pub fn final_flush(&mut self, total_length: u64) -> StorageResult<bool> {
        self.validate_state(UploadState::NON_TERMINAL)?;
        self.check_not_finalizing()?;
        if total_length != self.total_sent_bytes {
            return Err(StorageError::InvalidArgument(format!(
                "(totalLength == totalSentBytes) ({} == {})",
                total_length, self.total_sent_bytes
            )));
        }
        let flush = self.flush_request();
        let already_last = self.queue.back() == Some(&flush);
        if already_last && self.final_flush_signaled {
            return Ok(true);
        }
        if already_last && self.last_sent == self.queue.len().checked_sub(1) {
            self.final_flush_signaled = true;
            self.final_flush_sent = true;
            return Ok(true);
        }
        let offered = self.internal_offer(flush);
        if offered {
            self.final_flush_signaled = true;
        }
        Ok(offered)
    }

    fn internal_offer(&mut self, request: WriteObjectRequest) -> bool {
        let prepend = request.first_message.is_some();
        if prepend && self.queue.front().is_some_and(|r| r.first_message.is_some()) {
            self.poll();
        }
        if request.finish_write {
            self.finish_write_signaled = true;
        }
        if request.checksummed_data.is_some() && !self.finish_write_signaled {
            let size = request.data_len();
            if size > self.available_capacity() {
                return false;
            }
            self.total_sent_bytes += size;
        }
        self.enqueued_bytes += request.data_len();
        if prepend {
            self.queue.push_front(request);
        } else {
            self.queue.push_back(request);
        }
        true
    }

    fn poll(&mut self) -> Option<WriteObjectRequest> {
        let removed = self.queue.pop_front();
        if removed.is_some() {
            self.last_sent = self.last_sent.and_then(|i| i.checked_sub(1));
        }
        removed
    }

    /// Build the first message for a new physical stream and return the call
    /// context to open it with.
    ///
    /// Outside `Initializing`, `Retrying` and `Takeover` the previous context
    /// is returned and nothing is enqueued.
    pub fn enqueue_first_message(&mut self) -> StorageResult<CallContext> {
        if !matches!(
            self.state,
            UploadState::Initializing | UploadState::Retrying | UploadState::Takeover
        ) {
            return Ok(self.last_ctx.clone().unwrap_or_else(|| self.base_ctx.clone()));
        }
        let mut params = format!("bucket={}&appendable=true", self.target.bucket());
        if let Some(token) = &self.routing_token {
            params.push_str("&routing_token=");
            params.push_str(token);
        }
        let ctx = self
            .base_ctx
            .clone()
            .with_extra_header(REQUEST_PARAMS_HEADER, params);

        let first = WriteObjectRequest {
            first_message: Some(self.first_message()?),
            state_lookup: self.state == UploadState::Retrying,
            ..Default::default()
        };
        self.internal_offer(first);
        self.last_ctx = Some(ctx.clone());
        Ok(ctx)
    }

    fn first_message(&self) -> StorageResult<FirstMessage> {
        match &self.target {
            UploadTarget::New(spec) => {
                if self.confirmed_bytes.is_none() {
                    return Ok(FirstMessage::Write(spec.clone()));
                }
                if self.generation == 0 {
                    return Err(StorageError::IllegalState("generation > 0".to_string()));
                }
                Ok(FirstMessage::Append(AppendObjectSpec {
                    bucket: spec.bucket.clone(),
                    object: spec.object.clone(),
                    generation: self.generation,
                    write_handle: self.write_handle.clone(),
                    routing_token: self.routing_token.clone(),
                }))
            }
            UploadTarget::Takeover(spec) => {
                let mut spec = spec.clone();
                if self.routing_token.is_some() {
                    spec.routing_token = self.routing_token.clone();
                }
                if self.write_handle.is_some() {
                    spec.write_handle = self.write_handle.clone();
                }
                Ok(FirstMessage::Append(spec))
            }
        }
    }

    /// Transmit every queued request not yet sent on the current stream.
    ///
    /// Consecutive requests are packed so flush and finish flags ride on the
    /// preceding data message; two data messages are never merged. While
    /// `Retrying` only the first message goes out, the rest wait for the
    /// reconciling response.
    pub fn send_via(
        &mut self,
        mut send: impl FnMut(WriteObjectRequest) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.validate_state(&[
            UploadState::Initializing,
            UploadState::Running,
            UploadState::Retrying,
            UploadState::Takeover,
        ])?;
        let start = self.last_sent.map_or(0, |i| i + 1);
        if self.state == UploadState::Retrying {
            if start == 0 {
                if let Some(first) = self.queue.front().cloned() {
                    self.last_sent = Some(0);
                    send(first)?;
                }
            }
            return Ok(());
        }

        let mut prev: Option<WriteObjectRequest> = None;
        for i in start..self.queue.len() {
            let m = self.queue[i].clone();
            self.last_sent = Some(i);
            prev = Some(match prev {
                Some(p) if p.checksummed_data.is_some() && m.checksummed_data.is_some() => {
                    send(p)?;
                    m
                }
                Some(p) => concatenate(p, m)?,
                None => m,
            });
        }
        if let Some(p) = prev {
            if p.finish_write {
                self.finish_write_sent = true;
            } else if p.flush && p.state_lookup && self.final_flush_signaled {
                self.final_flush_sent = true;
            }
            send(p)?;
        }
        Ok(())
    }

    /// Apply one server response.
    ///
    /// Returns the final object once the upload has completed. An error means
    /// the response contradicts what was sent; the caller routes it to the
    /// retry context.
    pub fn on_response(
        &mut self,
        response: &WriteObjectResponse,
    ) -> StorageResult<Option<ObjectMetadata>> {
        self.validate_state(UploadState::NON_TERMINAL)?;
        if let Some(handle) = &response.write_handle {
            self.write_handle = Some(handle.clone());
        }
        let persisted = persisted_size(response)?;

        if self.state == UploadState::Takeover
            || self.return_after_retry == Some(UploadState::Takeover)
        {
            self.total_sent_bytes = persisted;
            self.confirmed_bytes = Some(persisted);
            if let Some(crc) = response.resource.as_ref().and_then(|r| r.crc32c) {
                if self.cumulative_crc32c.is_some() {
                    self.cumulative_crc32c = Some(Crc32cLengthKnown::new(crc, persisted));
                }
            }
            let done = self.update_from_response(response)?;
            self.state = UploadState::Running;
            return Ok(done);
        }

        let total = self.total_sent_bytes;
        let finalizing = self.is_finalizing();
        if persisted > total {
            return Err(StorageError::DataLoss(format!(
                "Server reports more bytes persisted than were sent (persisted_size = {}, total_sent = {})",
                persisted, total
            )));
        }
        if finalizing && persisted < total && persisted <= self.min_byte_offset {
            if self.last_resource.is_some() {
                return Err(StorageError::DataLoss(format!(
                    "Finalized size does not match bytes sent (persisted_size = {}, total_sent = {})",
                    persisted, total
                )));
            }
            return Ok(None);
        }
        self.update_from_response(response)
    }

    fn update_from_response(
        &mut self,
        response: &WriteObjectResponse,
    ) -> StorageResult<Option<ObjectMetadata>> {
        let persisted = persisted_size(response)?;
        if let Some(resource) = &response.resource {
            self.generation = resource.generation;
            self.last_resource = Some(resource.clone());
        }
        if let Some(confirmed) = self.confirmed_bytes {
            if persisted < confirmed {
                return Err(StorageError::DataLoss(format!(
                    "(persistedSize >= confirmedBytes) ({} >= {})",
                    persisted, confirmed
                )));
            }
        }
        self.validate_state(&[
            UploadState::Initializing,
            UploadState::Takeover,
            UploadState::Running,
            UploadState::Retrying,
        ])?;
        self.routing_token = None;
        if matches!(self.state, UploadState::Initializing | UploadState::Retrying) {
            if self.confirmed_bytes.is_none() {
                self.confirmed_bytes = Some(persisted);
                self.total_sent_bytes = self.total_sent_bytes.max(persisted);
            }
            self.return_after_retry = None;
            self.state = UploadState::Running;
        }

        let mut terminal = false;
        while let Some(peek) = self.queue.front() {
            if let Some(data) = &peek.checksummed_data {
                let size = data.content.len() as u64;
                let end = peek.write_offset + size;
                if end > persisted {
                    break;
                }
                self.min_byte_offset = peek.write_offset;
                self.poll();
                self.confirmed_bytes = Some(end);
                self.enqueued_bytes -= size;
            } else if peek.first_message.is_some() {
                self.poll();
            } else if peek.flush {
                if self.final_flush_sent && persisted == self.total_sent_bytes {
                    self.confirmed_bytes = Some(persisted);
                    terminal = true;
                    self.poll();
                } else if persisted >= peek.write_offset {
                    self.confirmed_bytes = Some(persisted);
                    self.poll();
                } else {
                    break;
                }
            } else if peek.finish_write {
                if self.enqueued_bytes != 0 {
                    return Err(StorageError::IllegalState(
                        "attempting to evict finish_write: true while bytes are still enqueued"
                            .to_string(),
                    ));
                }
                match &response.resource {
                    Some(resource) if persisted == self.total_sent_bytes => {
                        self.confirmed_bytes = Some(persisted);
                        if !resource.finalized {
                            break;
                        }
                        terminal = true;
                        self.poll();
                    }
                    _ => break,
                }
            } else {
                return Err(StorageError::IllegalState(format!(
                    "unexpected queued request {:?} for response {:?}",
                    peek, response
                )));
            }
        }

        if !terminal {
            return Ok(None);
        }
        let Some(resource) = &self.last_resource else {
            return Err(StorageError::IllegalState(
                "signalTerminalSuccess without prior resource response".to_string(),
            ));
        };
        let mut done = resource.clone();
        done.size = self.confirmed_bytes.unwrap_or(persisted);
        done.crc32c = self.cumulative_crc32c.map(|c| c.value());
        self.state = UploadState::TerminalSuccess;
        Ok(Some(done))
    }

    /// Apply routing information from a redirect. The generation may be
    /// learned but never changed.
    pub fn update_from_redirect(
        &mut self,
        routing_token: Option<String>,
        write_handle: Option<Bytes>,
        generation: Option<u64>,
    ) -> StorageResult<()> {
        self.validate_state(&[
            UploadState::Initializing,
            UploadState::Takeover,
            UploadState::Running,
            UploadState::PendingRetry,
            UploadState::Retrying,
        ])?;
        if write_handle.is_some() {
            self.write_handle = write_handle;
        }
        if routing_token.is_some() {
            self.routing_token = routing_token;
        }
        if let Some(generation) = generation {
            if self.generation > 0 && self.generation != generation {
                return Err(StorageError::IllegalState(format!(
                    "Generation changed: (generation == redirect.generation) ({} == {})",
                    self.generation, generation
                )));
            }
            self.generation = generation;
        }
        Ok(())
    }

    pub fn terminal_error(&mut self) {
        if !self.state.is_terminal() {
            self.state = UploadState::TerminalError;
        }
    }

    /// The current stream is gone; remember where to return after the retry.
    pub fn pending_retry(&mut self) -> StorageResult<()> {
        self.validate_state(UploadState::NON_TERMINAL)?;
        if !matches!(self.state, UploadState::PendingRetry | UploadState::Retrying) {
            self.return_after_retry = Some(self.state);
        }
        self.state = UploadState::PendingRetry;
        Ok(())
    }

    /// A replacement stream is being opened; everything queued is unsent.
    pub fn retrying(&mut self) -> StorageResult<()> {
        self.validate_state(&[
            UploadState::PendingRetry,
            UploadState::Initializing,
            UploadState::Takeover,
            UploadState::Retrying,
        ])?;
        if self.state == UploadState::Takeover {
            self.return_after_retry = Some(UploadState::Takeover);
        }
        self.state = UploadState::Retrying;
        self.last_sent = None;
        self.finish_write_sent = false;
        Ok(())
    }
}

fn persisted_size(response: &WriteObjectResponse) -> StorageResult<u64> {
    response
        .persisted_size
        .or_else(|| response.resource.as_ref().map(|r| r.size))
        .ok_or_else(|| {
            StorageError::IllegalState(
                "response carries neither persisted_size nor resource".to_string(),
            )
        })
}

impl fmt::Debug for AppendUploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendUploadState")
            .field("state", &self.state)
            .field("queue_len", &self.queue.len())
            .field("enqueued_bytes", &self.enqueued_bytes)
            .field("last_sent", &self.last_sent)
            .field("total_sent_bytes", &self.total_sent_bytes)
            .field("confirmed_bytes", &self.confirmed_bytes)
            .field("generation", &self.generation)
            .finish()
    }
}
