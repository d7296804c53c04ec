//! Named exclusive locks and liveness sessions.
//!
//! A peer proves it is alive by holding the lock named after its [`PeerId`]
//! for its whole lifetime. Anyone else asking for that name (the registry's
//! watcher) only gets it once the peer's [`Session`] is closed, which is how
//! departures are detected without heartbeats.
//!
//! [`PeerId`]: contend_core::PeerId

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contend_core::{ContendError, Result};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type CloseHook = Box<dyn FnOnce(&str) + Send>;
type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Grants exclusive, FIFO-per-name locks.
///
/// Cheap to clone; clones share the same lock table.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: LockTable,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Result<Arc<AsyncMutex<()>>> {
        if name.is_empty() {
            return Err(ContendError::Lock("lock name must not be empty".into()));
        }
        let mut locks = self.locks.lock();
        Ok(Arc::clone(locks.entry(name.to_string()).or_default()))
    }

    /// Wait until `name` is free, then hold it until the session closes.
    pub async fn acquire(&self, name: &str) -> Result<Session> {
        let lock = self.entry(name)?;
        let guard = lock.lock_owned().await;
        debug!(lock = name, "Lock acquired");
        Ok(Session::new(name, guard, Arc::clone(&self.locks)))
    }

    /// Take `name` only if nobody holds it right now.
    pub fn try_acquire(&self, name: &str) -> Result<Option<Session>> {
        let lock = self.entry(name)?;
        Ok(lock
            .try_lock_owned()
            .ok()
            .map(|guard| Session::new(name, guard, Arc::clone(&self.locks))))
    }

    /// Names currently held, sorted.
    pub fn held(&self) -> Vec<String> {
        let locks = self.locks.lock();
        let mut names: Vec<String> = locks
            .iter()
            .filter(|(_, lock)| lock.try_lock().is_err())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("held", &self.held())
            .finish()
    }
}

/// A held named lock.
///
/// Closing releases the lock and runs the teardown hooks once. Dropping an
/// open session closes it.
pub struct Session {
    name: String,
    closed: AtomicBool,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
    /// Guards `closed` transitions too, so a hook is either queued or run.
    hooks: Mutex<Vec<CloseHook>>,
    table: LockTable,
}

impl Session {
    fn new(name: &str, guard: OwnedMutexGuard<()>, table: LockTable) -> Self {
        Self {
            name: name.to_string(),
            closed: AtomicBool::new(false),
            guard: Mutex::new(Some(guard)),
            hooks: Mutex::new(Vec::new()),
            table,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a teardown hook. Runs immediately if already closed.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let mut hooks = self.hooks.lock();
        if self.is_closed() {
            drop(hooks);
            hook(&self.name);
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Release the lock and run the teardown hooks. Idempotent.
    pub fn close(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        drop(self.guard.lock().take());
        self.forget_if_unused();
        for hook in hooks {
            hook(&self.name);
        }
        debug!(lock = %self.name, "Session closed");
    }

    /// Drop the table entry unless someone is waiting on it.
    fn forget_if_unused(&self) {
        let mut table = self.table.lock();
        // Entries are only cloned under the table lock, so the count is stable here.
        if table
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.name);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_acquire_blocks_until_close() {
        let locks = LockManager::new();
        let first = locks.acquire("peer-a").await.unwrap();

        let contender = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire("peer-a").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.close();
        let second = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!second.is_closed());
        assert_eq!(locks.held(), vec!["peer-a".to_string()]);
    }

    #[tokio::test]
    async fn test_try_acquire_reports_held_names() {
        let locks = LockManager::new();
        let session = locks.try_acquire("a").unwrap().unwrap();
        assert!(locks.try_acquire("a").unwrap().is_none());
        assert!(locks.try_acquire("b").unwrap().is_some());
        assert_eq!(locks.held(), vec!["a".to_string()]);

        drop(session);
        assert!(locks.held().is_empty());
    }

    #[tokio::test]
    async fn test_hooks_run_once() {
        let locks = LockManager::new();
        let session = locks.acquire("hooked").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        session.on_close(move |name| {
            assert_eq!(name, "hooked");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late hooks run immediately.
        let counter = Arc::clone(&calls);
        session.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_names_leave_the_table() {
        let locks = LockManager::new();
        let first = locks.acquire("peer-a").await.unwrap();
        let other = locks.acquire("peer-b").await.unwrap();

        let contender = tokio::spawn({
            let locks = locks.clone();
            async move { locks.acquire("peer-a").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A waiter keeps the entry alive.
        first.close();
        let second = contender.await.unwrap().unwrap();
        assert_eq!(locks.locks.lock().len(), 2);

        second.close();
        other.close();
        assert!(locks.locks.lock().is_empty());

        // The name can be taken again afterwards.
        assert!(locks.try_acquire("peer-a").unwrap().is_some());
    }

    #[test]
    fn test_hook_racing_close_always_runs() {
        for _ in 0..200 {
            let locks = LockManager::new();
            let session = Arc::new(locks.try_acquire("racy").unwrap().unwrap());
            let calls = Arc::new(AtomicUsize::new(0));

            let registrar = std::thread::spawn({
                let session = Arc::clone(&session);
                let calls = Arc::clone(&calls);
                move || {
                    for _ in 0..16 {
                        let calls = Arc::clone(&calls);
                        session.on_close(move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                }
            });
            session.close();
            registrar.join().unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 16);
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let locks = LockManager::new();
        assert!(matches!(locks.try_acquire(""), Err(ContendError::Lock(_))));
    }
}
