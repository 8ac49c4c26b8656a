//! The bidi stream boundary.
//!
//! A `BidiTransport` opens physical streams. Each stream reports inbound
//! traffic to a `ResponseObserver`; the caller pushes requests through the
//! returned `RequestStream`.
//!
//! Contract for implementations:
//! - observer callbacks are never invoked while `open` or `send` is on the
//!   caller's stack of an append stream; read streams also accept them inline
//! - after `on_error` or `on_complete`, no further callbacks arrive for that
//!   stream

use crate::error::StorageResult;
use crate::wire::CallContext;
use std::sync::Arc;

pub trait ResponseObserver<Resp>: Send + Sync {
    fn on_response(&self, response: Resp);
    fn on_error(&self, error: crate::error::StorageError);
    fn on_complete(&self);
}

pub trait RequestStream<Req>: Send + Sync {
    fn send(&self, request: Req) -> StorageResult<()>;
    /// Half-close; the server may still respond.
    fn close_send(&self);
    fn is_open(&self) -> bool;
}

pub trait BidiTransport<Req, Resp>: Send + Sync + 'static {
    fn open(
        &self,
        ctx: CallContext,
        observer: Arc<dyn ResponseObserver<Resp>>,
    ) -> StorageResult<Box<dyn RequestStream<Req>>>;
}
