use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use palisade_primitives::transaction::TransactionMeta;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{ProducerError, TransactionError};
use crate::TxTrace;

/// Completion responder for an asynchronously submitted transaction. Fires
/// exactly once, with a trace or a concrete error.
pub type TxResponder = tokio::sync::oneshot::Sender<Result<TxTrace, TransactionError>>;

/// An incoming transaction travelling through the admission pipeline.
#[derive(Debug)]
pub(crate) struct TxSubmission {
    pub tx: Arc<TransactionMeta>,
    pub persist_until_expired: bool,
    pub responder: Option<TxResponder>,
}

/// Error of a recovery job that did not run to completion.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RecoveryError {
    #[error("signature recovery panicked")]
    Panicked,
    #[error("signature recovery cancelled")]
    Cancelled,
}

/// Worker pool for CPU-bound transaction signature recovery.
///
/// A thin wrapper around a *rayon* thread pool sized by `producer-threads`.
/// The network-facing submission returns immediately; recovery runs here and
/// the caller awaits the returned handle before admitting the transaction.
#[derive(Debug)]
pub(crate) struct SignatureWorkerPool {
    pool: ThreadPool,
}

impl SignatureWorkerPool {
    pub fn new(threads: usize) -> Result<Self, ProducerError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("producer-verify-{i}"))
            .build()
            .map_err(|err| ProducerError::Config(err.to_string()))?;

        Ok(Self { pool })
    }

    /// Spawns a recovery job in this thread pool, returning a handle for
    /// awaiting the result asynchronously.
    pub fn spawn<F, R>(&self, func: F) -> KeyRecoveryHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(func)));
        });
        KeyRecoveryHandle { inner: rx }
    }
}

#[derive(Debug)]
#[must_use = "KeyRecoveryHandle does nothing unless polled"]
pub(crate) struct KeyRecoveryHandle<T> {
    inner: oneshot::Receiver<Result<T, Box<dyn Any + Send>>>,
}

impl<T> Future for KeyRecoveryHandle<T> {
    type Output = Result<T, RecoveryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().inner).poll(cx) {
            Poll::Ready(Ok(result)) => match result {
                Ok(value) => Poll::Ready(Ok(value)),
                Err(_panic) => Poll::Ready(Err(RecoveryError::Panicked)),
            },
            Poll::Ready(Err(..)) => Poll::Ready(Err(RecoveryError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use palisade_primitives::{Digest, PrivateKey, Timestamp};

    use super::*;

    #[tokio::test]
    async fn recovery_completes_on_the_worker_pool() {
        let key = PrivateKey::random();
        let digest = Digest::hash(b"transfer");
        let sig = key.sign(&digest).unwrap();
        let tx = Arc::new(TransactionMeta::new(digest, Timestamp::MAX, vec![sig]));

        let pool = SignatureWorkerPool::new(2).unwrap();
        let job = Arc::clone(&tx);
        pool.spawn(move || {
            job.recover_keys();
        })
        .await
        .unwrap();

        assert!(tx.keys_recovered());
        assert_eq!(tx.recover_keys(), &[key.public_key()]);
    }

    #[tokio::test]
    async fn panics_are_contained_in_the_handle() {
        let pool = SignatureWorkerPool::new(1).unwrap();
        let handle: KeyRecoveryHandle<()> = pool.spawn(|| panic!("bad recovery"));
        assert_matches!(handle.await, Err(RecoveryError::Panicked));
    }
}
