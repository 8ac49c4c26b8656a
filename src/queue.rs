//! Ordered aggregation of asynchronous partial results.
//!
//! ```text
//! append(f1) append(f2)          append(f3) ...        close()
//!    │          │   len == max      │                     │
//!    ▼          ▼   ──────────►     ▼                     ▼
//!  [f1]      [f1,f2] ─compact─► [agg(f1,f2)] [f3] ──► agg(all) ──► result
//! ```
//!
//! Compactions run on the runtime handle as soon as the queue fills, so the
//! aggregation work overlaps with the producer. Results are reduced in append
//! order regardless of resolution order; when several elements fail, the
//! earliest appended failure is the one reported.

use crate::completion::{Completion, SharedResult};
use crate::error::{StorageError, StorageResult};
use futures::future::{join_all, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

pub type Aggregator<T> = Arc<dyn Fn(Vec<T>) -> T + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Closing,
    Closed,
}

struct QueueInner<T: Clone + Send + Sync + 'static> {
    state: QueueState,
    elements: Vec<SharedResult<T>>,
    short_circuit: Option<StorageError>,
}

pub struct AsyncAppendingQueue<T: Clone + Send + Sync + 'static> {
    handle: Handle,
    max_elements_per_compact: usize,
    aggregator: Aggregator<T>,
    inner: Arc<Mutex<QueueInner<T>>>,
    result: Arc<Completion<T>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncAppendingQueue<T> {
    pub fn new(
        handle: Handle,
        max_elements_per_compact: usize,
        aggregator: impl Fn(Vec<T>) -> T + Send + Sync + 'static,
    ) -> StorageResult<Self> {
        if max_elements_per_compact <= 1 {
            return Err(StorageError::InvalidArgument(format!(
                "maxElementsPerCompact must be > 1 (maxElementsPerCompact = {})",
                max_elements_per_compact
            )));
        }
        Ok(AsyncAppendingQueue {
            handle,
            max_elements_per_compact,
            aggregator: Arc::new(aggregator),
            inner: Arc::new(Mutex::new(QueueInner {
                state: QueueState::Open,
                elements: Vec::with_capacity(max_elements_per_compact),
                short_circuit: None,
            })),
            result: Arc::new(Completion::new()),
        })
    }

    /// Add the next partial result.
    ///
    /// Fails once the queue is closed, and with `ShortCircuited` once any
    /// earlier element has failed; the final result is then cancelled.
    pub fn append<F>(&self, value: F) -> StorageResult<()>
    where
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Open {
            return Err(StorageError::IllegalState("already closed".to_string()));
        }
        if let Some(failure) = &inner.short_circuit {
            self.result.complete(Err(StorageError::Cancelled {
                message: "Short circuited by a previously failed element".to_string(),
                cause: Some(Box::new(failure.clone())),
                suppressed: Vec::new(),
            }));
            return Err(StorageError::ShortCircuited(Box::new(failure.clone())));
        }

        let element = value.boxed().shared();
        match element.clone().now_or_never() {
            Some(Err(e)) => {
                inner.short_circuit.get_or_insert(e);
            }
            Some(Ok(_)) => {}
            None => self.watch(element.clone()),
        }
        inner.elements.push(element);

        if inner.elements.len() == self.max_elements_per_compact {
            let pending = std::mem::take(&mut inner.elements);
            debug!(elements = pending.len(), "compacting queue");
            let compacted = self.compact(pending);
            inner.elements.push(compacted);
        }
        Ok(())
    }

    /// Record the element's failure if it happens while the queue is open.
    fn watch(&self, element: SharedResult<T>) {
        let inner = self.inner.clone();
        self.handle.spawn(async move {
            if let Err(e) = element.await {
                let mut inner = inner.lock();
                if inner.state == QueueState::Open && inner.short_circuit.is_none() {
                    inner.short_circuit = Some(e);
                }
            }
        });
    }

    fn compact(&self, elements: Vec<SharedResult<T>>) -> SharedResult<T> {
        let aggregator = self.aggregator.clone();
        let task = self.handle.spawn(async move {
            let results = join_all(elements).await;
            let mut values = Vec::with_capacity(results.len());
            for result in results {
                values.push(result?);
            }
            Ok(aggregator(values))
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(StorageError::cancelled(format!("compaction task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Stop accepting elements and reduce everything appended.
    ///
    /// Idempotent. Fails with `NeverAppendedTo`, as does the result, when
    /// nothing was ever appended.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Open {
            return Ok(());
        }
        inner.state = QueueState::Closing;

        if inner.elements.is_empty() {
            self.result.complete(Err(StorageError::NeverAppendedTo));
            inner.state = QueueState::Closed;
            return Err(StorageError::NeverAppendedTo);
        }

        let pending = std::mem::take(&mut inner.elements);
        let last = self.compact(pending);
        let result = self.result.clone();
        self.handle.spawn(async move {
            result.complete(last.await);
        });
        inner.state = QueueState::Closed;
        Ok(())
    }

    /// The same future on every call.
    pub fn result(&self) -> SharedResult<T> {
        self.result.future()
    }

    pub async fn wait(&self) -> StorageResult<T> {
        self.result().await
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for AsyncAppendingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AsyncAppendingQueue")
            .field("state", &inner.state)
            .field("elements", &inner.elements.len())
            .field("max_elements_per_compact", &self.max_elements_per_compact)
            .field("short_circuited", &inner.short_circuit.is_some())
            .finish()
    }
}
