//! Settable, shareable result cells.
//!
//! A `Completion` is written once from the I/O side and awaited from any
//! number of caller tasks. Later writes are ignored.

use crate::error::{StorageError, StorageResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub type SharedResult<T> = Shared<BoxFuture<'static, StorageResult<T>>>;

pub struct Completion<T: Clone + Send + Sync + 'static> {
    sender: Mutex<Option<oneshot::Sender<StorageResult<T>>>>,
    future: SharedResult<T>,
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let future = async move {
            rx.await
                .unwrap_or_else(|_| Err(StorageError::cancelled("result abandoned before completion")))
        }
        .boxed()
        .shared();
        Completion {
            sender: Mutex::new(Some(tx)),
            future,
        }
    }

    /// Set the result. Returns false if it was already set.
    pub fn complete(&self, result: StorageResult<T>) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn future(&self) -> SharedResult<T> {
        self.future.clone()
    }

    /// The result, if already set.
    pub fn try_result(&self) -> Option<StorageResult<T>> {
        if !self.is_done() {
            return None;
        }
        self.future.clone().now_or_never()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_completion_wins() {
        let c: Completion<u32> = Completion::new();
        assert!(!c.is_done());
        assert!(c.try_result().is_none());

        assert!(c.complete(Ok(1)));
        assert!(!c.complete(Ok(2)));
        assert!(c.is_done());
        assert_eq!(c.try_result().unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_many_awaiters_see_same_value() {
        let c: Completion<String> = Completion::new();
        let a = c.future();
        let b = c.future();
        c.complete(Err(StorageError::unavailable("gone")));
        assert_eq!(a.await.unwrap_err().to_string(), "UNAVAILABLE: gone");
        assert_eq!(b.await.unwrap_err().to_string(), "UNAVAILABLE: gone");
    }

    #[tokio::test]
    async fn test_dropped_completion_cancels() {
        let c: Completion<u8> = Completion::new();
        let fut = c.future();
        drop(c);
        assert!(fut.await.unwrap_err().is_cancelled());
    }
}
