//! FIFO async mutex for whole operations.
//!
//! [`SerialMutex::run`] executes one operation at a time, in the order the
//! callers queued. The result handed back is the result of that caller's own
//! operation; a failing operation does not disturb the ones queued behind it.
//!
//! # Limitations
//!
//! There is no timeout. An operation that never completes wedges the mutex for
//! every later caller. A caller is queued when its `run` future is first
//! polled; dropping that future before its turn removes it from the queue
//! without running the operation.
//!
//! # Example
//!
//! ```
//! use contend_pool::SerialMutex;
//!
//! # tokio_test::block_on(async {
//! let mutex = SerialMutex::new();
//! let value = mutex.run(|| async { 40 + 2 }).await;
//! assert_eq!(value, 42);
//!
//! let failed: Result<(), &str> = mutex.run(|| async { Err("boom") }).await;
//! assert!(failed.is_err());
//!
//! // The failure did not poison the mutex.
//! assert_eq!(mutex.run(|| async { "next" }).await, "next");
//! # });
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

/// Serializes async operations in FIFO order.
///
/// Backed by `tokio::sync::Mutex`, which hands the lock to waiters in the
/// order they started waiting and does not poison on failure or panic.
#[derive(Debug, Default)]
pub struct SerialMutex {
    lock: Mutex<()>,
    queued: AtomicUsize,
}

/// Decrements the queue depth however `run` exits.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SerialMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` once every previously queued operation has finished.
    pub async fn run<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _queued = QueuedGuard::enter(&self.queued);
        let _turn = self.lock.lock().await;
        operation().await
    }

    /// Operations currently waiting or running.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order_regardless_of_latency() {
        let mutex = SerialMutex::new();
        let observed = Arc::new(SyncMutex::new(Vec::new()));

        // Earlier operations sleep longer; order must still be call order.
        let ops = (0..5u64).map(|i| {
            let mutex = &mutex;
            let observed = Arc::clone(&observed);
            async move {
                mutex
                    .run(|| async move {
                        observed.lock().push(format!("start {i}"));
                        tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                        observed.lock().push(format!("end {i}"));
                        i
                    })
                    .await
            }
        });
        let results = futures::future::join_all(ops).await;

        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*observed.lock(), expected);
    }

    #[tokio::test]
    async fn test_failure_does_not_skip_following_operations() {
        let mutex = SerialMutex::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ops = (0..4usize).map(|i| {
            let mutex = &mutex;
            let ran = Arc::clone(&ran);
            async move {
                mutex
                    .run(|| async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        if i == 1 {
                            Err(format!("operation {i} failed"))
                        } else {
                            Ok(i)
                        }
                    })
                    .await
            }
        });
        let results = futures::future::join_all(ops).await;

        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[1], Err("operation 1 failed".to_string()));
        assert_eq!(results[2], Ok(2));
        assert_eq!(results[3], Ok(3));
    }

    #[tokio::test]
    async fn test_never_more_than_one_running() {
        let mutex = Arc::new(SerialMutex::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                tokio::spawn(async move {
                    mutex
                        .run(|| async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(mutex.queued(), 0);
    }

    #[tokio::test]
    async fn test_queued_counts_waiters() {
        let mutex = Arc::new(SerialMutex::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let mutex = Arc::clone(&mutex);
            tokio::spawn(async move {
                mutex
                    .run(|| async move {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        let waiter = {
            let mutex = Arc::clone(&mutex);
            tokio::spawn(async move { mutex.run(|| async {}).await })
        };

        while mutex.queued() < 2 {
            tokio::task::yield_now().await;
        }
        release_tx.send(()).unwrap();
        holder.await.unwrap();
        waiter.await.unwrap();
        assert_eq!(mutex.queued(), 0);
    }
}
