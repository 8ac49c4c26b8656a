//! Mutable state of one read session stream.
//!
//! Holds the base open request, everything learned from the server (metadata,
//! read handle, routing token), and the outstanding reads keyed by read id.
//!
//! The read map is written by callers (new reads) and by the response path
//! (completion, failure). Removal is compare-and-remove on the `Arc`
//! identity so a read re-keyed by `assign_new_read_id` is never removed
//! through its stale id.

use crate::error::{StorageError, StorageResult};
use crate::read::op::StreamRead;
use crate::wire::{
    CallContext, ObjectMetadata, OpenArguments, ReadObjectRequest, ReadObjectSpec,
    REQUEST_PARAMS_HEADER,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Learned {
    metadata: Option<ObjectMetadata>,
    read_handle: Option<Bytes>,
    routing_token: Option<String>,
}

pub struct ReadSessionState {
    base_ctx: CallContext,
    base_request: ReadObjectRequest,
    read_id_seq: Arc<AtomicU64>,
    learned: Mutex<Learned>,
    outstanding: Mutex<BTreeMap<u64, Arc<StreamRead>>>,
}

impl ReadSessionState {
    pub fn new(base_ctx: CallContext, base_request: ReadObjectRequest) -> Self {
        ReadSessionState {
            base_ctx,
            base_request,
            read_id_seq: Arc::new(AtomicU64::new(1)),
            learned: Mutex::new(Learned::default()),
            outstanding: Mutex::new(BTreeMap::new()),
        }
    }

    /// State for a sibling stream of the same object.
    ///
    /// Shares the read id sequence; copies handle, token and metadata; starts
    /// with no outstanding reads.
    pub fn fork_child(&self) -> Self {
        let learned = self.learned.lock();
        ReadSessionState {
            base_ctx: self.base_ctx.clone(),
            base_request: self.base_request.clone(),
            read_id_seq: self.read_id_seq.clone(),
            learned: Mutex::new(Learned {
                metadata: learned.metadata.clone(),
                read_handle: learned.read_handle.clone(),
                routing_token: learned.routing_token.clone(),
            }),
            outstanding: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn new_read_id(&self) -> u64 {
        self.read_id_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn can_handle_new_read(&self, read: &StreamRead) -> bool {
        self.outstanding
            .lock()
            .values()
            .all(|existing| existing.can_share_stream_with(read))
    }

    /// Request that (re)establishes the physical stream for the current state.
    pub fn open_arguments(&self) -> OpenArguments<ReadObjectRequest> {
        let mut request = self.base_request.clone();
        request.read_ranges.clear();
        let mut spec = request.read_object_spec.take().unwrap_or_default();

        {
            let learned = self.learned.lock();
            if let Some(metadata) = &learned.metadata {
                if spec.generation != Some(metadata.generation) {
                    spec.generation = Some(metadata.generation);
                }
            }
            if let Some(token) = &learned.routing_token {
                spec.routing_token = Some(token.clone());
            }
            if let Some(handle) = &learned.read_handle {
                spec.read_handle = Some(handle.clone());
            }
        }

        let reads: Vec<Arc<StreamRead>> = self.outstanding.lock().values().cloned().collect();
        request.read_ranges = reads
            .iter()
            .filter(|r| r.ready_to_send())
            .map(|r| r.make_read_range())
            .collect();

        let ctx = self
            .base_ctx
            .clone()
            .with_extra_header(REQUEST_PARAMS_HEADER, request_params(&spec));
        request.read_object_spec = Some(spec);
        OpenArguments { ctx, request }
    }

    pub fn put_outstanding_read(&self, read_id: u64, read: Arc<StreamRead>) {
        self.outstanding.lock().insert(read_id, read);
    }

    pub fn get_outstanding_read(&self, read_id: u64) -> Option<Arc<StreamRead>> {
        self.outstanding.lock().get(&read_id).cloned()
    }

    pub fn remove_outstanding_read(&self, read_id: u64) -> Option<Arc<StreamRead>> {
        self.outstanding.lock().remove(&read_id)
    }

    /// Remove only if `read_id` still maps to this exact read.
    pub fn remove_outstanding_read_if(&self, read_id: u64, read: &Arc<StreamRead>) -> bool {
        let mut outstanding = self.outstanding.lock();
        match outstanding.get(&read_id) {
            Some(current) if Arc::ptr_eq(current, read) => {
                outstanding.remove(&read_id);
                true
            }
            _ => false,
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Re-key an outstanding read under a fresh id.
    pub fn assign_new_read_id(&self, old_id: u64) -> StorageResult<Arc<StreamRead>> {
        let mut outstanding = self.outstanding.lock();
        let read = outstanding.remove(&old_id).ok_or_else(|| {
            StorageError::IllegalState(format!("unable to locate old read (read_id: {})", old_id))
        })?;
        let new_id = self.new_read_id();
        read.set_read_id(new_id);
        outstanding.insert(new_id, read.clone());
        Ok(read)
    }

    /// Drain every outstanding read and fail it. Returns how many were failed.
    ///
    /// The map is emptied under the lock, so concurrent drains never see the
    /// same read twice.
    pub fn fail_all(&self, error: impl Fn() -> StorageError) -> usize {
        let drained: Vec<Arc<StreamRead>> = {
            let mut outstanding = self.outstanding.lock();
            std::mem::take(&mut *outstanding).into_values().collect()
        };
        for read in &drained {
            read.pre_fail();
        }
        for read in &drained {
            read.fail(error());
        }
        drained.len()
    }

    pub fn metadata(&self) -> Option<ObjectMetadata> {
        self.learned.lock().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: ObjectMetadata) {
        self.learned.lock().metadata = Some(metadata);
    }

    pub fn is_resolved(&self) -> bool {
        self.learned.lock().metadata.is_some()
    }

    pub fn read_handle(&self) -> Option<Bytes> {
        self.learned.lock().read_handle.clone()
    }

    pub fn set_read_handle(&self, handle: Bytes) {
        self.learned.lock().read_handle = Some(handle);
    }

    pub fn routing_token(&self) -> Option<String> {
        self.learned.lock().routing_token.clone()
    }

    pub fn set_routing_token(&self, token: Option<String>) {
        self.learned.lock().routing_token = token;
    }
}

fn request_params(spec: &ReadObjectSpec) -> String {
    let mut params = format!("bucket={}", spec.bucket);
    if let Some(token) = &spec.routing_token {
        params.push_str("&routing_token=");
        params.push_str(token);
    }
    params
}
