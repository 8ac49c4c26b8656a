//! In-memory object server speaking the bidi read and append protocols.
//!
//! ## Architecture
//!
//! ```text
//! client ──send()──► SimulatedStorageServer (lock held)
//!                        │ apply request, roll faults
//!                        ▼
//!                    event queues (per protocol, FIFO)
//!                        │
//! test loop ──pump()──► pop one event, release lock, call observer
//! ```
//!
//! Requests are applied as they are sent; responses are only delivered by
//! `pump`, never on the sender's stack. Once a stream receives an error or
//! completion, nothing more is queued for it.

use crate::error::{Code, ReadRangeError, StorageError, StorageResult};
use crate::simulator::DeterministicRng;
use crate::transport::{BidiTransport, RequestStream, ResponseObserver};
use crate::wire::{
    CallContext, ChecksummedData, FirstMessage, ObjectMetadata, ObjectRangeData, ReadObjectRequest,
    ReadObjectResponse, ReadRange, WriteObjectRequest, WriteObjectResponse, REQUEST_PARAMS_HEADER,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Fault probabilities, each rolled per request or per emitted chunk.
#[derive(Debug, Clone)]
pub struct SimulatedServerConfig {
    /// Stream fails with UNAVAILABLE
    pub stream_drop_prob: f64,
    /// Request applied but the stream drops before the acknowledgement
    pub persist_before_drop_prob: f64,
    /// Stream fails with a redirect carrying a routing token
    pub redirect_prob: f64,
    /// Chunk delivered with a wrong CRC32C
    pub corrupt_crc_prob: f64,
    /// Stream fails naming one read as rejected
    pub range_error_prob: f64,
    /// Chunk resent starting before the client's position
    pub overlap_prob: f64,
    /// Stream completes before describing the object
    pub complete_without_response_prob: f64,
    /// Largest chunk carried by one read response
    pub chunk_size: usize,
}

impl Default for SimulatedServerConfig {
    fn default() -> Self {
        SimulatedServerConfig {
            stream_drop_prob: 0.02,          // 2%
            persist_before_drop_prob: 0.5,   // 50% of drops
            redirect_prob: 0.02,             // 2%
            corrupt_crc_prob: 0.002,         // 0.2%
            range_error_prob: 0.002,         // 0.2%
            overlap_prob: 0.01,              // 1%
            complete_without_response_prob: 0.01,
            chunk_size: 32,
        }
    }
}

impl SimulatedServerConfig {
    pub fn high_chaos() -> Self {
        SimulatedServerConfig {
            stream_drop_prob: 0.08,
            persist_before_drop_prob: 0.5,
            redirect_prob: 0.05,
            corrupt_crc_prob: 0.01,
            range_error_prob: 0.01,
            overlap_prob: 0.05,
            complete_without_response_prob: 0.05,
            chunk_size: 16,
        }
    }

    pub fn no_faults() -> Self {
        SimulatedServerConfig {
            stream_drop_prob: 0.0,
            persist_before_drop_prob: 0.0,
            redirect_prob: 0.0,
            corrupt_crc_prob: 0.0,
            range_error_prob: 0.0,
            overlap_prob: 0.0,
            complete_without_response_prob: 0.0,
            chunk_size: 64,
        }
    }

    /// Faults that never fail an operation outright: drops, redirects,
    /// overlaps and early completions are all recoverable by retry.
    pub fn recoverable_only(mut self) -> Self {
        self.corrupt_crc_prob = 0.0;
        self.range_error_prob = 0.0;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedServerStats {
    pub read_streams_opened: u64,
    pub append_streams_opened: u64,
    pub routed_opens: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    pub chunks_sent: u64,
    pub bytes_served: u64,
    pub bytes_persisted: u64,
    pub duplicates_ignored: u64,
    pub stream_drops: u64,
    pub redirects: u64,
    pub corruptions: u64,
    pub range_errors: u64,
    pub overlaps: u64,
    pub completes_without_response: u64,
    pub events_delivered: u64,
}

enum Delivery<Resp> {
    Response(Resp),
    Error(StorageError),
    Complete,
}

struct Event<Resp> {
    observer: Arc<dyn ResponseObserver<Resp>>,
    delivery: Delivery<Resp>,
}

impl<Resp> Event<Resp> {
    fn deliver(self) {
        match self.delivery {
            Delivery::Response(r) => self.observer.on_response(r),
            Delivery::Error(e) => self.observer.on_error(e),
            Delivery::Complete => self.observer.on_complete(),
        }
    }
}

type ObjectKey = (String, String);

struct SimObject {
    generation: u64,
    data: BytesMut,
    finalized: bool,
}

impl SimObject {
    fn metadata(&self, key: &ObjectKey) -> ObjectMetadata {
        ObjectMetadata {
            bucket: key.0.clone(),
            name: key.1.clone(),
            generation: self.generation,
            size: self.data.len() as u64,
            crc32c: Some(crc32c::crc32c(&self.data)),
            finalized: self.finalized,
        }
    }

    fn handle(&self) -> Bytes {
        Bytes::from(format!("handle-{}", self.generation))
    }
}

struct StreamSlot<Resp> {
    observer: Arc<dyn ResponseObserver<Resp>>,
    /// Object bound by the first request
    bound: Option<(ObjectKey, u64)>,
    dead: bool,
    half_closed: bool,
}

impl<Resp> StreamSlot<Resp> {
    fn new(observer: Arc<dyn ResponseObserver<Resp>>) -> Self {
        StreamSlot {
            observer,
            bound: None,
            dead: false,
            half_closed: false,
        }
    }

    fn accepts(&self) -> bool {
        !self.dead && !self.half_closed
    }
}

struct ServerInner {
    rng: DeterministicRng,
    config: SimulatedServerConfig,
    objects: HashMap<ObjectKey, SimObject>,
    next_generation: u64,
    next_stream_id: u64,
    next_route: u64,
    read_streams: HashMap<u64, StreamSlot<ReadObjectResponse>>,
    append_streams: HashMap<u64, StreamSlot<WriteObjectResponse>>,
    read_events: VecDeque<Event<ReadObjectResponse>>,
    append_events: VecDeque<Event<WriteObjectResponse>>,
    stats: SimulatedServerStats,
}

fn queue_event<Resp>(
    events: &mut VecDeque<Event<Resp>>,
    slot: &mut StreamSlot<Resp>,
    delivery: Delivery<Resp>,
) {
    if slot.dead {
        return;
    }
    if !matches!(delivery, Delivery::Response(_)) {
        slot.dead = true;
    }
    events.push_back(Event {
        observer: slot.observer.clone(),
        delivery,
    });
}

fn routed(ctx: &CallContext) -> bool {
    ctx.header(REQUEST_PARAMS_HEADER)
        .is_some_and(|p| p.contains("routing_token="))
}

impl ServerInner {
    fn next_route_token(&mut self) -> String {
        self.next_route += 1;
        format!("route-{}", self.next_route)
    }

    // -----------------------------------------------------------------------
    // Read protocol
    // -----------------------------------------------------------------------

    fn open_read(&mut self, ctx: &CallContext, observer: Arc<dyn ResponseObserver<ReadObjectResponse>>) -> u64 {
        self.next_stream_id += 1;
        let id = self.next_stream_id;
        self.stats.read_streams_opened += 1;
        if routed(ctx) {
            self.stats.routed_opens += 1;
        }
        self.read_streams.insert(id, StreamSlot::new(observer));
        trace!(stream = id, "read stream opened");
        id
    }

    fn read_request(&mut self, id: u64, request: ReadObjectRequest) -> StorageResult<()> {
        let Some(slot) = self.read_streams.get_mut(&id) else {
            return Err(StorageError::IllegalState(format!("unknown read stream {}", id)));
        };
        if !slot.accepts() {
            return Ok(());
        }
        self.stats.read_requests += 1;

        if slot.bound.is_none() {
            let Some(spec) = request.read_object_spec else {
                queue_event(
                    &mut self.read_events,
                    slot,
                    Delivery::Error(StorageError::status(
                        Code::InvalidArgument,
                        "first request must carry read_object_spec",
                    )),
                );
                return Ok(());
            };
            if self.rng.gen_bool(self.config.complete_without_response_prob) {
                self.stats.completes_without_response += 1;
                queue_event(&mut self.read_events, slot, Delivery::Complete);
                return Ok(());
            }
            let key = (spec.bucket.clone(), spec.object.clone());
            let Some(object) = self.objects.get(&key) else {
                queue_event(
                    &mut self.read_events,
                    slot,
                    Delivery::Error(StorageError::status(
                        Code::NotFound,
                        format!("object {}/{} not found", key.0, key.1),
                    )),
                );
                return Ok(());
            };
            if spec.generation.is_some_and(|g| g != object.generation) {
                queue_event(
                    &mut self.read_events,
                    slot,
                    Delivery::Error(StorageError::status(
                        Code::NotFound,
                        format!("generation {:?} of {}/{} not found", spec.generation, key.0, key.1),
                    )),
                );
                return Ok(());
            }
            if self.rng.gen_bool(self.config.redirect_prob) {
                self.stats.redirects += 1;
                self.next_route += 1;
                let error = StorageError::ReadRedirected {
                    routing_token: Some(format!("route-{}", self.next_route)),
                    read_handle: Some(object.handle()),
                };
                queue_event(&mut self.read_events, slot, Delivery::Error(error));
                return Ok(());
            }
            let response = ReadObjectResponse {
                metadata: Some(object.metadata(&key)),
                read_handle: Some(object.handle()),
                object_data_ranges: Vec::new(),
            };
            slot.bound = Some((key, object.generation));
            queue_event(&mut self.read_events, slot, Delivery::Response(response));
        }

        for range in request.read_ranges {
            if !self.serve_range(id, range) {
                break;
            }
        }
        Ok(())
    }

    /// Queue the chunks of one range. False once the stream has ended.
    fn serve_range(&mut self, id: u64, range: ReadRange) -> bool {
        let ServerInner {
            rng,
            config,
            objects,
            read_streams,
            read_events,
            stats,
            ..
        } = self;
        let Some(slot) = read_streams.get_mut(&id) else {
            return false;
        };
        let Some((key, _)) = slot.bound.clone() else {
            return false;
        };
        let Some(object) = objects.get(&key) else {
            return false;
        };
        let data = Bytes::copy_from_slice(&object.data);
        let size = data.len() as u64;
        if range.read_offset > size {
            let error = StorageError::out_of_range(format!(
                "read_offset {} beyond object size {}",
                range.read_offset, size
            ));
            queue_event(read_events, slot, Delivery::Error(error));
            return false;
        }
        let end = match range.read_length {
            0 => size,
            len => range.read_offset.saturating_add(len).min(size),
        };
        let chunk_size = config.chunk_size.max(1) as u64;

        let mut pos = range.read_offset;
        loop {
            if rng.gen_bool(config.stream_drop_prob) {
                stats.stream_drops += 1;
                let error = StorageError::unavailable("simulated stream drop");
                queue_event(read_events, slot, Delivery::Error(error));
                return false;
            }
            if rng.gen_bool(config.range_error_prob) {
                stats.range_errors += 1;
                let error = StorageError::ReadRangeErrors {
                    message: "simulated range rejection".to_string(),
                    errors: vec![ReadRangeError {
                        read_id: range.read_id,
                        code: Code::FailedPrecondition,
                        message: format!("read {} rejected", range.read_id),
                    }],
                };
                queue_event(read_events, slot, Delivery::Error(error));
                return false;
            }

            let chunk_end = (pos + chunk_size).min(end);
            let overlap = pos > range.read_offset && rng.gen_bool(config.overlap_prob);
            let begin = if overlap {
                stats.overlaps += 1;
                pos - (pos - range.read_offset).min((chunk_size / 2).max(1))
            } else {
                pos
            };
            let content = data.slice(begin as usize..chunk_end as usize);
            let mut crc = crc32c::crc32c(&content);
            if rng.gen_bool(config.corrupt_crc_prob) {
                stats.corruptions += 1;
                crc ^= 0x5a5a_5a5a;
            }
            stats.chunks_sent += 1;
            stats.bytes_served += content.len() as u64;
            let range_end = !overlap && chunk_end == end;
            let response = ReadObjectResponse {
                metadata: None,
                read_handle: None,
                object_data_ranges: vec![ObjectRangeData {
                    read_range: ReadRange {
                        read_offset: begin,
                        read_length: content.len() as u64,
                        read_id: range.read_id,
                    },
                    checksummed_data: ChecksummedData {
                        content,
                        crc32c: Some(crc),
                    },
                    range_end,
                }],
            };
            queue_event(read_events, slot, Delivery::Response(response));
            // the client re-requests the rest under a new read id
            if overlap || range_end {
                return true;
            }
            pos = chunk_end;
        }
    }

    // -----------------------------------------------------------------------
    // Append protocol
    // -----------------------------------------------------------------------

    fn open_append(&mut self, ctx: &CallContext, observer: Arc<dyn ResponseObserver<WriteObjectResponse>>) -> u64 {
        self.next_stream_id += 1;
        let id = self.next_stream_id;
        self.stats.append_streams_opened += 1;
        if routed(ctx) {
            self.stats.routed_opens += 1;
        }
        self.append_streams.insert(id, StreamSlot::new(observer));
        trace!(stream = id, "append stream opened");
        id
    }

    fn write_request(&mut self, id: u64, request: WriteObjectRequest) -> StorageResult<()> {
        match self.append_streams.get(&id) {
            None => return Err(StorageError::IllegalState(format!("unknown append stream {}", id))),
            Some(slot) if !slot.accepts() => return Ok(()),
            Some(_) => {}
        }
        self.stats.write_requests += 1;

        if self.rng.gen_bool(self.config.stream_drop_prob) {
            self.stats.stream_drops += 1;
            if self.rng.gen_bool(self.config.persist_before_drop_prob) {
                // acknowledgement lost
                let _ = self.apply_write(id, &request);
            }
            self.fail_append(id, StorageError::unavailable("simulated stream drop"));
            return Ok(());
        }
        if request.first_message.is_some() && self.rng.gen_bool(self.config.redirect_prob) {
            self.stats.redirects += 1;
            let routing_token = Some(self.next_route_token());
            let generation = match &request.first_message {
                Some(FirstMessage::Append(spec)) => Some(spec.generation),
                _ => None,
            };
            self.fail_append(
                id,
                StorageError::WriteRedirected {
                    routing_token,
                    write_handle: None,
                    generation,
                },
            );
            return Ok(());
        }

        match self.apply_write(id, &request) {
            Ok(Some(response)) => {
                if let Some(slot) = self.append_streams.get_mut(&id) {
                    queue_event(&mut self.append_events, slot, Delivery::Response(response));
                }
            }
            Ok(None) => {}
            Err(e) => self.fail_append(id, e),
        }
        Ok(())
    }

    fn fail_append(&mut self, id: u64, error: StorageError) {
        if let Some(slot) = self.append_streams.get_mut(&id) {
            queue_event(&mut self.append_events, slot, Delivery::Error(error));
        }
    }

    /// Apply one request and build its response, if it warrants one.
    fn apply_write(
        &mut self,
        id: u64,
        request: &WriteObjectRequest,
    ) -> StorageResult<Option<WriteObjectResponse>> {
        let ServerInner {
            objects,
            append_streams,
            next_generation,
            stats,
            ..
        } = self;
        let Some(slot) = append_streams.get_mut(&id) else {
            return Err(StorageError::IllegalState(format!("unknown append stream {}", id)));
        };

        match &request.first_message {
            Some(FirstMessage::Write(spec)) => {
                let key = (spec.bucket.clone(), spec.object.clone());
                if let (Some(0), Some(_)) = (spec.if_generation_match, objects.get(&key)) {
                    return Err(StorageError::status(
                        Code::FailedPrecondition,
                        format!("{}/{} already exists", key.0, key.1),
                    ));
                }
                *next_generation += 1;
                let generation = *next_generation;
                objects.insert(
                    key.clone(),
                    SimObject {
                        generation,
                        data: BytesMut::new(),
                        finalized: false,
                    },
                );
                slot.bound = Some((key, generation));
            }
            Some(FirstMessage::Append(spec)) => {
                let key = (spec.bucket.clone(), spec.object.clone());
                match objects.get(&key) {
                    Some(object) if object.generation == spec.generation => {
                        slot.bound = Some((key, spec.generation));
                    }
                    _ => {
                        return Err(StorageError::status(
                            Code::NotFound,
                            format!(
                                "generation {} of {}/{} not found",
                                spec.generation, key.0, key.1
                            ),
                        ))
                    }
                }
            }
            None => {}
        }

        let Some((key, generation)) = slot.bound.clone() else {
            return Err(StorageError::status(
                Code::FailedPrecondition,
                "first request must carry the object spec",
            ));
        };
        let object = match objects.get_mut(&key) {
            Some(object) if object.generation == generation => object,
            _ => {
                return Err(StorageError::status(
                    Code::NotFound,
                    format!("generation {} of {}/{} is gone", generation, key.0, key.1),
                ))
            }
        };

        if let Some(data) = &request.checksummed_data {
            let size = object.data.len() as u64;
            let end = request.write_offset + data.content.len() as u64;
            if let Some(expected) = data.crc32c {
                let actual = crc32c::crc32c(&data.content);
                if actual != expected {
                    return Err(StorageError::status(
                        Code::InvalidArgument,
                        format!("checksum mismatch: expected {} actual {}", expected, actual),
                    ));
                }
            }
            if request.write_offset > size {
                return Err(StorageError::out_of_range(format!(
                    "write_offset {} beyond persisted size {}",
                    request.write_offset, size
                )));
            }
            if end <= size {
                stats.duplicates_ignored += 1;
            } else if object.finalized {
                return Err(StorageError::status(
                    Code::FailedPrecondition,
                    "object is finalized",
                ));
            } else {
                let skip = (size - request.write_offset) as usize;
                object.data.extend_from_slice(&data.content[skip..]);
                stats.bytes_persisted += (end - size) as u64;
            }
        }

        if request.finish_write && !object.finalized {
            let size = object.data.len() as u64;
            if request.write_offset != size {
                return Err(StorageError::out_of_range(format!(
                    "finish_write at {} but persisted size is {}",
                    request.write_offset, size
                )));
            }
            if let Some(expected) = request.object_checksums {
                let actual = crc32c::crc32c(&object.data);
                if actual != expected {
                    return Err(StorageError::status(
                        Code::InvalidArgument,
                        format!("object checksum mismatch: expected {} actual {}", expected, actual),
                    ));
                }
            }
            object.finalized = true;
        }

        let first = request.first_message.is_some();
        if !(first || request.flush || request.state_lookup || request.finish_write) {
            return Ok(None);
        }
        let with_resource = first || request.finish_write || object.finalized;
        Ok(Some(WriteObjectResponse {
            persisted_size: Some(object.data.len() as u64),
            resource: with_resource.then(|| object.metadata(&key)),
            write_handle: first.then(|| object.handle()),
        }))
    }
}

/// Deterministic in-memory server. Clones share state.
#[derive(Clone)]
pub struct SimulatedStorageServer {
    inner: Arc<Mutex<ServerInner>>,
}

impl SimulatedStorageServer {
    pub fn new(seed: u64, config: SimulatedServerConfig) -> Self {
        SimulatedStorageServer {
            inner: Arc::new(Mutex::new(ServerInner {
                rng: DeterministicRng::new(seed),
                config,
                objects: HashMap::new(),
                next_generation: 1000,
                next_stream_id: 0,
                next_route: 0,
                read_streams: HashMap::new(),
                append_streams: HashMap::new(),
                read_events: VecDeque::new(),
                append_events: VecDeque::new(),
                stats: SimulatedServerStats::default(),
            })),
        }
    }

    /// Store a finalized object and return its metadata.
    pub fn insert_object(&self, bucket: &str, name: &str, data: Bytes) -> ObjectMetadata {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let key = (bucket.to_string(), name.to_string());
        let object = SimObject {
            generation: inner.next_generation,
            data: BytesMut::from(&data[..]),
            finalized: true,
        };
        let metadata = object.metadata(&key);
        inner.objects.insert(key, object);
        metadata
    }

    /// Current metadata and content of an object.
    pub fn object(&self, bucket: &str, name: &str) -> Option<(ObjectMetadata, Bytes)> {
        let inner = self.inner.lock();
        let key = (bucket.to_string(), name.to_string());
        inner
            .objects
            .get(&key)
            .map(|o| (o.metadata(&key), Bytes::copy_from_slice(&o.data)))
    }

    pub fn read_transport(&self) -> Arc<SimulatedReadTransport> {
        Arc::new(SimulatedReadTransport {
            server: self.clone(),
        })
    }

    pub fn append_transport(&self) -> Arc<SimulatedAppendTransport> {
        Arc::new(SimulatedAppendTransport {
            server: self.clone(),
        })
    }

    /// Change fault probabilities from now on.
    pub fn set_config(&self, config: SimulatedServerConfig) {
        self.inner.lock().config = config;
    }

    /// Deliver one queued event. Returns false when nothing was queued.
    ///
    /// When both protocols have events the one delivered is chosen by the
    /// seeded generator.
    pub fn pump(&self) -> bool {
        enum Next {
            Read(Event<ReadObjectResponse>),
            Append(Event<WriteObjectResponse>),
        }
        let next = {
            let mut inner = self.inner.lock();
            let pick_read = match (inner.read_events.is_empty(), inner.append_events.is_empty()) {
                (true, true) => return false,
                (false, true) => true,
                (true, false) => false,
                (false, false) => inner.rng.gen_bool(0.5),
            };
            inner.stats.events_delivered += 1;
            let next = if pick_read {
                inner.read_events.pop_front().map(Next::Read)
            } else {
                inner.append_events.pop_front().map(Next::Append)
            };
            match next {
                Some(next) => next,
                None => return false,
            }
        };
        match next {
            Next::Read(event) => event.deliver(),
            Next::Append(event) => event.deliver(),
        }
        true
    }

    /// Deliver up to `max` events. Returns how many were delivered.
    pub fn pump_all(&self, max: usize) -> usize {
        let mut delivered = 0;
        while delivered < max && self.pump() {
            delivered += 1;
        }
        delivered
    }

    pub fn pending_events(&self) -> usize {
        let inner = self.inner.lock();
        inner.read_events.len() + inner.append_events.len()
    }

    pub fn stats(&self) -> SimulatedServerStats {
        self.inner.lock().stats.clone()
    }
}

impl std::fmt::Debug for SimulatedStorageServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimulatedStorageServer")
            .field("objects", &inner.objects.len())
            .field("read_events", &inner.read_events.len())
            .field("append_events", &inner.append_events.len())
            .finish()
    }
}

pub struct SimulatedReadTransport {
    server: SimulatedStorageServer,
}

struct SimulatedReadStream {
    server: SimulatedStorageServer,
    id: u64,
}

impl BidiTransport<ReadObjectRequest, ReadObjectResponse> for SimulatedReadTransport {
    fn open(
        &self,
        ctx: CallContext,
        observer: Arc<dyn ResponseObserver<ReadObjectResponse>>,
    ) -> StorageResult<Box<dyn RequestStream<ReadObjectRequest>>> {
        let id = self.server.inner.lock().open_read(&ctx, observer);
        Ok(Box::new(SimulatedReadStream {
            server: self.server.clone(),
            id,
        }))
    }
}

impl RequestStream<ReadObjectRequest> for SimulatedReadStream {
    fn send(&self, request: ReadObjectRequest) -> StorageResult<()> {
        self.server.inner.lock().read_request(self.id, request)
    }

    fn close_send(&self) {
        if let Some(slot) = self.server.inner.lock().read_streams.get_mut(&self.id) {
            slot.half_closed = true;
        }
    }

    fn is_open(&self) -> bool {
        self.server
            .inner
            .lock()
            .read_streams
            .get(&self.id)
            .is_some_and(|s| s.accepts())
    }
}

pub struct SimulatedAppendTransport {
    server: SimulatedStorageServer,
}

struct SimulatedAppendStream {
    server: SimulatedStorageServer,
    id: u64,
}

impl BidiTransport<WriteObjectRequest, WriteObjectResponse> for SimulatedAppendTransport {
    fn open(
        &self,
        ctx: CallContext,
        observer: Arc<dyn ResponseObserver<WriteObjectResponse>>,
    ) -> StorageResult<Box<dyn RequestStream<WriteObjectRequest>>> {
        let id = self.server.inner.lock().open_append(&ctx, observer);
        Ok(Box::new(SimulatedAppendStream {
            server: self.server.clone(),
            id,
        }))
    }
}

impl RequestStream<WriteObjectRequest> for SimulatedAppendStream {
    fn send(&self, request: WriteObjectRequest) -> StorageResult<()> {
        self.server.inner.lock().write_request(self.id, request)
    }

    fn close_send(&self) {
        if let Some(slot) = self.server.inner.lock().append_streams.get_mut(&self.id) {
            slot.half_closed = true;
        }
    }

    fn is_open(&self) -> bool {
        self.server
            .inner
            .lock()
            .append_streams
            .get(&self.id)
            .is_some_and(|s| s.accepts())
    }
}
