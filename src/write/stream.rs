//! The physical append stream driving an `AppendUploadState`.
//!
//! All mutation happens under one lock around the upload state and the
//! current request stream. Retry continuations, redirect restarts and result
//! completion run after the lock is released.

use crate::checksum::ChunkSegment;
use crate::completion::{Completion, SharedResult};
use crate::error::{StorageError, StorageResult};
use crate::retry::RetryContext;
use crate::transport::{BidiTransport, RequestStream, ResponseObserver};
use crate::wire::{ObjectMetadata, WriteObjectRequest, WriteObjectResponse};
use crate::write::state::{AppendUploadState, UploadState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub type AppendTransport = dyn BidiTransport<WriteObjectRequest, WriteObjectResponse>;

struct Core {
    state: AppendUploadState,
    stream: Option<Box<dyn RequestStream<WriteObjectRequest>>>,
    epoch: u64,
}

pub struct AppendStream {
    me: Weak<AppendStream>,
    transport: Arc<AppendTransport>,
    retry: RetryContext,
    max_redirects: u32,
    redirects: AtomicU32,
    core: Mutex<Core>,
    result: Completion<ObjectMetadata>,
    progress: Notify,
}

impl AppendStream {
    pub fn new(
        transport: Arc<AppendTransport>,
        state: AppendUploadState,
        retry: RetryContext,
        max_redirects: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| AppendStream {
            me: me.clone(),
            transport,
            retry,
            max_redirects,
            redirects: AtomicU32::new(0),
            core: Mutex::new(Core {
                state,
                stream: None,
                epoch: 0,
            }),
            result: Completion::new(),
            progress: Notify::new(),
        })
    }

    /// Resolves with the final object, or the error that ended the upload.
    pub fn result(&self) -> SharedResult<ObjectMetadata> {
        self.result.future()
    }

    pub fn try_result(&self) -> Option<StorageResult<ObjectMetadata>> {
        self.result.try_result()
    }

    /// Woken on every response and on termination.
    pub fn progress(&self) -> &Notify {
        &self.progress
    }

    pub fn upload_state(&self) -> UploadState {
        self.core.lock().state.state()
    }

    pub fn available_capacity(&self) -> u64 {
        self.core.lock().state.available_capacity()
    }

    pub fn total_sent_bytes(&self) -> u64 {
        self.core.lock().state.total_sent_bytes()
    }

    pub fn confirmed_bytes(&self) -> Option<u64> {
        self.core.lock().state.confirmed_bytes()
    }

    pub fn is_active(&self) -> bool {
        self.core.lock().stream.is_some()
    }

    /// Read the upload state under the lock.
    pub fn inspect<T>(&self, f: impl FnOnce(&AppendUploadState) -> T) -> T {
        f(&self.core.lock().state)
    }

    /// Enqueue and transmit a segment. `Ok(false)` means no capacity.
    pub fn append(&self, segment: ChunkSegment) -> StorageResult<bool> {
        self.locked(|this, core, failed| {
            let offered = core.state.offer_segment(segment)?;
            if offered {
                this.internal_send(core, failed);
            }
            Ok(offered)
        })
    }

    pub fn append_and_flush(&self, segment: ChunkSegment) -> StorageResult<bool> {
        self.locked(|this, core, failed| {
            let offered = core.state.offer_segment(segment)?;
            if offered {
                this.flush_locked(core, failed)?;
            }
            Ok(offered)
        })
    }

    pub fn append_and_finalize(&self, segment: ChunkSegment) -> StorageResult<bool> {
        self.locked(|this, core, failed| {
            let offered = core.state.offer_segment(segment)?;
            if offered {
                let total = core.state.total_sent_bytes();
                this.finish_write_locked(core, total, failed)?;
            }
            Ok(offered)
        })
    }

    /// Ask the server to persist everything sent so far and report it.
    pub fn flush(&self) -> StorageResult<()> {
        self.locked(|this, core, failed| this.flush_locked(core, failed))
    }

    /// Finalize the object at `length` bytes.
    pub fn finish_write(&self, length: u64) -> StorageResult<bool> {
        self.locked(|this, core, failed| this.finish_write_locked(core, length, failed))
    }

    /// End the upload with a final flush, leaving the object appendable.
    pub fn close_stream(&self, length: u64) -> StorageResult<bool> {
        self.locked(|this, core, failed| {
            let offered = core.state.final_flush(length)?;
            if offered {
                this.internal_send(core, failed);
            }
            Ok(offered)
        })
    }

    /// Half-close the current physical stream.
    pub fn send_close(&self) {
        let stream = self.core.lock().stream.take();
        if let Some(stream) = stream {
            stream.close_send();
        }
    }

    /// Run `f` under the lock.
    ///
    /// A transport failure is not returned to the caller: the request stays
    /// queued and the failure goes to the retry context after unlocking.
    fn locked<T>(
        &self,
        f: impl FnOnce(&Self, &mut Core, &mut Option<StorageError>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut failed = None;
        let result = {
            let mut core = self.core.lock();
            f(self, &mut core, &mut failed)
        };
        if let Some(e) = failed {
            self.record_error(e);
        }
        result
    }

    fn flush_locked(&self, core: &mut Core, failed: &mut Option<StorageError>) -> StorageResult<()> {
        let flush = core.state.flush_request();
        if core.state.peek_last() != Some(&flush) && !core.state.offer(flush)? {
            return Ok(());
        }
        self.internal_send(core, failed);
        Ok(())
    }

    fn finish_write_locked(
        &self,
        core: &mut Core,
        length: u64,
        failed: &mut Option<StorageError>,
    ) -> StorageResult<bool> {
        if core.state.is_finalizing() && core.state.total_sent_bytes() == length {
            return Ok(true);
        }
        let finish = core.state.finish_write_request(length);
        let offered = core.state.offer(finish)?;
        if offered {
            self.internal_send(core, failed);
        }
        Ok(offered)
    }

    /// Lazily open the first stream, then transmit anything unsent.
    fn internal_send(&self, core: &mut Core, failed: &mut Option<StorageError>) {
        if core.stream.is_none() {
            if core.state.state() != UploadState::Initializing {
                return;
            }
            if let Err(e) = self.init_stream(core) {
                *failed = Some(e);
                return;
            }
        }
        if let Err(e) = send_pending(core) {
            *failed = Some(e);
        }
    }

    fn init_stream(&self, core: &mut Core) -> StorageResult<()> {
        let ctx = core.state.enqueue_first_message()?;
        core.epoch += 1;
        let observer = Arc::new(UploadObserver {
            stream: self.me.clone(),
            epoch: core.epoch,
        });
        let stream = self.transport.open(ctx, observer)?;
        debug!(epoch = core.epoch, state = %core.state.state(), "append stream opened");
        core.stream = Some(stream);
        Ok(())
    }

    /// Open a replacement stream and resend the first message.
    pub fn restart(&self) -> StorageResult<()> {
        self.restart_inner(true)
    }

    fn restart_inner(&self, strict: bool) -> StorageResult<()> {
        let mut core = self.core.lock();
        if core.stream.is_some() {
            if strict {
                return Err(StorageError::IllegalState(
                    "attempting to restart stream when stream is already active".to_string(),
                ));
            }
            return Ok(());
        }
        if core.state.state().is_terminal() {
            return Ok(());
        }
        core.state.retrying()?;
        self.init_stream(&mut core)?;
        send_pending(&mut core)
    }

    /// Reconcile a takeover: open a stream whose first response teaches the
    /// persisted size and checksum of the existing object.
    pub fn begin_takeover(&self) -> StorageResult<()> {
        self.core.lock().state.pending_retry()?;
        self.restart()
    }

    fn restart_or_record(&self) {
        if let Err(e) = self.restart_inner(false) {
            self.record_error(e);
        }
    }

    /// Drop the current stream so the next attempt starts from the queue.
    fn reset(&self, core: &mut Core) -> StorageResult<()> {
        if let Some(stream) = core.stream.take() {
            core.epoch += 1;
            stream.close_send();
            if !core.state.state().is_terminal() {
                core.state.pending_retry()?;
            }
        }
        Ok(())
    }

    fn record_error(&self, error: StorageError) {
        let reset = {
            let mut core = self.core.lock();
            self.reset(&mut core)
        };
        if let Err(e) = reset {
            warn!(error = %e, "could not reset append stream");
            self.fail(error);
            return;
        }
        let restart = self.me.clone();
        let fail = self.me.clone();
        self.retry.record_error(
            error,
            Box::new(move || {
                if let Some(stream) = restart.upgrade() {
                    stream.restart_or_record();
                }
            }),
            Box::new(move |e| {
                if let Some(stream) = fail.upgrade() {
                    stream.fail(e);
                }
            }),
        );
    }

    fn fail(&self, error: StorageError) {
        let stream = {
            let mut core = self.core.lock();
            core.state.terminal_error();
            core.epoch += 1;
            core.stream.take()
        };
        if let Some(stream) = stream {
            stream.close_send();
        }
        if self.result.complete(Err(error.clone())) {
            warn!(error = %error, "append upload failed");
        }
        self.progress.notify_waiters();
    }

    fn on_response(&self, epoch: u64, response: WriteObjectResponse) {
        let outcome = {
            let mut core = self.core.lock();
            if core.epoch != epoch || core.stream.is_none() {
                return;
            }
            self.redirects.store(0, Ordering::Release);
            match core.state.on_response(&response) {
                Ok(Some(done)) => {
                    if let Some(stream) = core.stream.take() {
                        stream.close_send();
                    }
                    Ok(Some(done))
                }
                Ok(None) => {
                    if core.state.state() == UploadState::Running {
                        send_pending(&mut core).map(|_| None)
                    } else {
                        Ok(None)
                    }
                }
                Err(e) => Err(e),
            }
        };
        match outcome {
            Ok(Some(done)) => {
                self.retry.reset();
                info!(
                    object = %done.name,
                    generation = done.generation,
                    size = done.size,
                    finalized = done.finalized,
                    "append upload complete"
                );
                self.result.complete(Ok(done));
            }
            Ok(None) => self.retry.reset(),
            Err(e) => self.record_error(e),
        }
        self.progress.notify_waiters();
    }

    fn on_error(&self, epoch: u64, error: StorageError) {
        {
            let core = self.core.lock();
            if core.epoch != epoch || core.stream.is_none() {
                return;
            }
        }
        let StorageError::WriteRedirected {
            routing_token,
            write_handle,
            generation,
        } = error
        else {
            self.record_error(error);
            return;
        };

        let redirects = self.redirects.fetch_add(1, Ordering::AcqRel) + 1;
        if redirects > self.max_redirects {
            self.record_error(StorageError::WriteRedirected {
                routing_token,
                write_handle,
                generation,
            });
            return;
        }
        debug!(redirects, ?routing_token, "following write redirect");
        let redirected = {
            let mut core = self.core.lock();
            self.reset(&mut core).and_then(|_| {
                core.state
                    .update_from_redirect(routing_token, write_handle, generation)
            })
        };
        match redirected {
            Ok(()) => self.restart_or_record(),
            Err(e) => self.record_error(e),
        }
    }

    fn on_complete(&self, epoch: u64) {
        let current = {
            let core = self.core.lock();
            core.epoch == epoch && core.stream.is_some()
        };
        if current && !self.result.is_done() {
            self.record_error(StorageError::unavailable(
                "append stream completed before the upload finished",
            ));
        }
    }
}

fn send_pending(core: &mut Core) -> StorageResult<()> {
    let Core { state, stream, .. } = core;
    match stream {
        Some(stream) => state.send_via(|request| stream.send(request)),
        None => Ok(()),
    }
}

struct UploadObserver {
    stream: Weak<AppendStream>,
    epoch: u64,
}

impl ResponseObserver<WriteObjectResponse> for UploadObserver {
    fn on_response(&self, response: WriteObjectResponse) {
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
