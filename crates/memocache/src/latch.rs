//! A write-once, read-many completion signal.
//!
//! The [`Latch`] is what every caller of an in-flight lookup waits on. It is a
//! [`Shared`](futures::future::Shared) wrapper around a oneshot receiver: the task running the
//! lookup owns the single [`LatchWriter`], every waiter owns a clone of the [`Latch`].
//!
//! If the writer is dropped without resolving the latch, which is what happens when the lookup
//! task is cancelled, all waiters observe [`CacheError::Cancelled`] instead of hanging.

use std::fmt;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

use crate::CacheError;

type Outcome<V, E> = Result<V, CacheError<E>>;

/// The reading side of a latch.
pub(crate) struct Latch<V, E> {
    inner: Shared<BoxFuture<'static, Outcome<V, E>>>,
}

/// The writing side of a latch.
pub(crate) struct LatchWriter<V, E> {
    sender: oneshot::Sender<Result<V, E>>,
}

impl<V, E> Latch<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a new unresolved latch and its writer.
    pub fn new() -> (Self, LatchWriter<V, E>) {
        let (sender, receiver) = oneshot::channel::<Result<V, E>>();
        let inner = async move {
            match receiver.await {
                Ok(result) => result.map_err(CacheError::Lookup),
                Err(_) => Err(CacheError::Cancelled),
            }
        }
        .boxed()
        .shared();

        (Self { inner }, LatchWriter { sender })
    }

    /// Waits for the latch to be resolved.
    pub async fn wait(&self) -> Outcome<V, E> {
        self.inner.clone().await
    }
}

impl<V, E> LatchWriter<V, E> {
    /// Resolves the latch, waking up every waiter.
    pub fn resolve(self, result: Result<V, E>) {
        // Nobody waiting is fine, the latch is dropped together with its map entry.
        let _ = self.sender.send(result);
    }
}

impl<V, E> Clone for Latch<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> fmt::Debug for Latch<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch").finish_non_exhaustive()
    }
}
