//! Round-robin dispatch over a pool of warm connections.
//!
//! This crate provides two pieces:
//!
//! - [`SerialMutex`]: FIFO async mutex for whole operations
//! - [`ConnectionJobPool`]: N connections to the same database behind a
//!   single `query` entry point
//!
//! # Key Design: one queue per job
//!
//! Each pooled connection ("job") is owned by a worker task fed by its own
//! FIFO queue with a single in-flight slot. Dispatch picks the job under the
//! cursor, advances the cursor modulo N, and enqueues the request there. So:
//!
//! 1. two calls routed to the same job never overlap, and run in dispatch order
//! 2. calls routed to different jobs run concurrently
//! 3. a failing query is reported to its caller only; the job keeps serving
//!
//! With `use_mutex` set, every job additionally funnels through one shared
//! [`SerialMutex`], collapsing the pool to fully serial execution. That mode
//! exists to measure the cost of serialization against real concurrency.
//!
//! # Example
//!
//! ```no_run
//! use contend_core::{config::PoolConfig, Batch, ConnectionFactory};
//! use contend_pool::ConnectionJobPool;
//!
//! # async fn example<F: ConnectionFactory>(factory: F) -> contend_core::Result<()> {
//! let config = PoolConfig { concurrency: 4, ..Default::default() };
//! let pool = ConnectionJobPool::open(&factory, &config).await?;
//!
//! // Routed to job 0, then job 1, ...
//! let rows = pool.query(Batch::new().sql("SELECT 1")).await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod serial_mutex;

pub use serial_mutex::SerialMutex;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use contend_core::config::PoolConfig;
use contend_core::{
    Batch, ConnectionFactory, ContendError, QueryChannel, QueryError, Result, ResultSet,
};
use futures::future::try_join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<std::result::Result<Vec<ResultSet>, QueryError>>;

/// One queued query.
struct JobRequest {
    batch: Batch,
    reply: Reply,
}

/// Counters for one job.
#[derive(Debug, Default)]
struct JobCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time counters of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub completed: u64,
    pub failed: u64,
    /// Requests dropped because their caller went away before execution.
    pub skipped: u64,
}

/// Point-in-time counters of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dispatched: u64,
    pub jobs: Vec<JobStats>,
}

struct Job {
    queue: mpsc::UnboundedSender<JobRequest>,
    counters: Arc<JobCounters>,
    worker: JoinHandle<()>,
}

/// A fixed set of connections with round-robin, per-connection serialized
/// dispatch.
pub struct ConnectionJobPool {
    label: String,
    jobs: Vec<Job>,
    cursor: AtomicUsize,
    dispatched: AtomicU64,
    use_mutex: bool,
}

impl ConnectionJobPool {
    /// Open `config.concurrency` connections from `factory` and start one
    /// worker per connection.
    ///
    /// Connections are opened concurrently unless `config.serialize_open` is
    /// set. Any failed open fails the whole pool.
    pub async fn open<F>(factory: &F, config: &PoolConfig) -> Result<Self>
    where
        F: ConnectionFactory,
    {
        let size = config.concurrency;
        if size == 0 {
            return Err(ContendError::Configuration(
                "pool concurrency must be at least 1".into(),
            ));
        }

        let open_mutex = SerialMutex::new();
        let opens = (0..size).map(|index| {
            let open_mutex = &open_mutex;
            async move {
                debug!(backend = factory.label(), index, "Opening pooled connection");
                if config.serialize_open {
                    open_mutex.run(|| factory.open(index)).await
                } else {
                    factory.open(index).await
                }
            }
        });
        let connections = try_join_all(opens).await?;

        let global = config.use_mutex.then(|| Arc::new(SerialMutex::new()));
        let jobs = connections
            .into_iter()
            .enumerate()
            .map(|(index, connection)| {
                let (queue, requests) = mpsc::unbounded_channel();
                let counters = Arc::new(JobCounters::default());
                let worker = tokio::spawn(run_job(
                    index,
                    connection,
                    requests,
                    global.clone(),
                    Arc::clone(&counters),
                ));
                Job {
                    queue,
                    counters,
                    worker,
                }
            })
            .collect();

        info!(
            backend = factory.label(),
            size,
            use_mutex = config.use_mutex,
            "Connection pool ready"
        );

        Ok(Self {
            label: factory.label().to_string(),
            jobs,
            cursor: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            use_mutex: config.use_mutex,
        })
    }

    /// Execute `batch` on the next job in round-robin order.
    ///
    /// The cursor advances when this future is first polled. The result is
    /// that of this query alone; failures come back as
    /// [`ContendError::PoolJob`] naming the job.
    pub async fn query(&self, batch: Batch) -> Result<Vec<ResultSet>> {
        let job = self.next_job();
        let (reply, response) = oneshot::channel();
        self.jobs[job]
            .queue
            .send(JobRequest { batch, reply })
            .map_err(|_| ContendError::ChannelClosed(format!("pool job {} queue", job)))?;

        match response.await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(source)) => Err(ContendError::PoolJob { job, source }),
            Err(_) => Err(ContendError::ChannelClosed(format!(
                "pool job {} worker",
                job
            ))),
        }
    }

    /// Pick the job for the next call and advance the cursor.
    fn next_job(&self) -> usize {
        let size = self.jobs.len();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % size))
        {
            Ok(i) | Err(i) => i,
        }
    }

    /// Job that the `k`-th call (1-based) of a fresh pool is routed to.
    #[must_use]
    pub fn route_of(&self, k: u64) -> usize {
        let size = self.jobs.len() as u64;
        (k.saturating_sub(1) % size) as usize
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.jobs.len()
    }

    /// Calls dispatched so far.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn uses_global_mutex(&self) -> bool {
        self.use_mutex
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dispatched: self.dispatched(),
            jobs: self
                .jobs
                .iter()
                .map(|job| JobStats {
                    completed: job.counters.completed.load(Ordering::Relaxed),
                    failed: job.counters.failed.load(Ordering::Relaxed),
                    skipped: job.counters.skipped.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Stop accepting work, let every job drain its queue, and wait for the
    /// workers to exit.
    pub async fn shutdown(self) -> Result<()> {
        let workers: Vec<JoinHandle<()>> = self
            .jobs
            .into_iter()
            .map(|job| {
                drop(job.queue);
                job.worker
            })
            .collect();
        for worker in workers {
            worker
                .await
                .map_err(|e| ContendError::Join(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueryChannel for ConnectionJobPool {
    async fn query(&self, batch: Batch) -> std::result::Result<Vec<ResultSet>, QueryError> {
        let sql = batch.summary();
        ConnectionJobPool::query(self, batch)
            .await
            .map_err(|err| match err {
                ContendError::PoolJob { source, .. } => source,
                other => QueryError::new(other.to_string(), sql),
            })
    }
}

/// Worker loop owning one connection.
async fn run_job<C>(
    index: usize,
    connection: C,
    mut requests: mpsc::UnboundedReceiver<JobRequest>,
    global: Option<Arc<SerialMutex>>,
    counters: Arc<JobCounters>,
) where
    C: QueryChannel,
{
    while let Some(JobRequest { batch, reply }) = requests.recv().await {
        if reply.is_closed() {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(job = index, "Caller went away, skipping queued query");
            continue;
        }

        let connection = &connection;
        let result = match &global {
            Some(mutex) => mutex.run(move || connection.query(batch)).await,
            None => connection.query(batch).await,
        };

        match &result {
            Ok(_) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job = index, error = %e, "Failed to run job");
            }
        }
        let _ = reply.send(result);
    }
    debug!(job = index, "Job queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use contend_core::SqlValue;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Shared observations across every fake connection.
    #[derive(Default)]
    struct Probe {
        active_total: AtomicUsize,
        max_total: AtomicUsize,
        active_per_job: Mutex<Vec<usize>>,
        max_per_job: Mutex<Vec<usize>>,
        executed: Mutex<Vec<(usize, String)>>,
        opening: AtomicUsize,
        max_opening: AtomicUsize,
    }

    struct FakeConnection {
        index: usize,
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl QueryChannel for FakeConnection {
        async fn query(
            &self,
            batch: Batch,
        ) -> std::result::Result<Vec<ResultSet>, QueryError> {
            let sql = batch.summary();
            let total = self.probe.active_total.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_total.fetch_max(total, Ordering::SeqCst);
            {
                let mut active = self.probe.active_per_job.lock();
                active[self.index] += 1;
                let mut max = self.probe.max_per_job.lock();
                max[self.index] = max[self.index].max(active[self.index]);
            }

            let delay = sql
                .strip_prefix("SLEEP ")
                .and_then(|ms| ms.parse::<u64>().ok())
                .unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.probe.executed.lock().push((self.index, sql.clone()));
            self.probe.active_per_job.lock()[self.index] -= 1;
            self.probe.active_total.fetch_sub(1, Ordering::SeqCst);

            if sql == "FAIL" {
                return Err(QueryError::new("forced failure", sql));
            }
            Ok(vec![ResultSet {
                columns: vec!["job".into()],
                rows: vec![vec![SqlValue::Integer(self.index as i64)]],
            }])
        }
    }

    struct FakeFactory {
        probe: Arc<Probe>,
        fail_open_at: Option<usize>,
    }

    impl FakeFactory {
        fn new(size: usize) -> Self {
            let probe = Probe {
                active_per_job: Mutex::new(vec![0; size]),
                max_per_job: Mutex::new(vec![0; size]),
                ..Default::default()
            };
            Self {
                probe: Arc::new(probe),
                fail_open_at: None,
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        fn label(&self) -> &str {
            "fake"
        }

        async fn open(&self, index: usize) -> Result<FakeConnection> {
            let now = self.probe.opening.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_opening.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.probe.opening.fetch_sub(1, Ordering::SeqCst);

            if self.fail_open_at == Some(index) {
                return Err(ContendError::connection("fake", format!("open {} refused", index)));
            }
            Ok(FakeConnection {
                index,
                probe: Arc::clone(&self.probe),
            })
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    fn pool_config(concurrency: usize) -> PoolConfig {
        PoolConfig {
            concurrency,
            ..Default::default()
        }
    }

    fn job_of(rows: &[ResultSet]) -> usize {
        rows[0].scalar_i64().unwrap() as usize
    }

    #[tokio::test]
    async fn test_round_robin_routing() {
        let factory = FakeFactory::new(3);
        let pool = ConnectionJobPool::open(&factory, &pool_config(3)).await.unwrap();

        for k in 1..=7u64 {
            let rows = pool.query(Batch::new().sql("SLEEP 1")).await.unwrap();
            assert_eq!(job_of(&rows), pool.route_of(k));
            assert_eq!(job_of(&rows), ((k - 1) % 3) as usize);
        }
        assert_eq!(pool.dispatched(), 7);
        assert_eq!(pool.stats().dispatched, 7);
    }

    #[tokio::test]
    async fn test_same_job_never_overlaps_different_jobs_do() {
        let factory = FakeFactory::new(2);
        let pool = ConnectionJobPool::open(&factory, &pool_config(2)).await.unwrap();

        let calls = (0..6).map(|_| pool.query(Batch::new().sql("SLEEP 20")));
        let results = futures::future::join_all(calls).await;
        for (k, result) in results.iter().enumerate() {
            assert_eq!(job_of(result.as_ref().unwrap()), k % 2);
        }

        let probe = &factory.probe;
        assert_eq!(*probe.max_per_job.lock(), vec![1, 1]);
        assert_eq!(probe.max_total.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_job_runs_in_dispatch_order() {
        let factory = FakeFactory::new(1);
        let pool = ConnectionJobPool::open(&factory, &pool_config(1)).await.unwrap();

        // Earlier calls are slower; execution order must still follow dispatch.
        let calls = [40, 30, 20, 10]
            .iter()
            .map(|ms| pool.query(Batch::new().sql(format!("SLEEP {}", ms))));
        futures::future::join_all(calls).await;

        let executed: Vec<String> = factory
            .probe
            .executed
            .lock()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect();
        assert_eq!(executed, vec!["SLEEP 40", "SLEEP 30", "SLEEP 20", "SLEEP 10"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_job() {
        let factory = FakeFactory::new(1);
        let pool = ConnectionJobPool::open(&factory, &pool_config(1)).await.unwrap();

        let err = pool.query(Batch::new().sql("FAIL")).await.unwrap_err();
        match err {
            ContendError::PoolJob { job, source } => {
                assert_eq!(job, 0);
                assert_eq!(source.message, "forced failure");
            }
            other => panic!("unexpected error {:?}", other),
        }

        let rows = pool.query(Batch::new().sql("SLEEP 1")).await.unwrap();
        assert_eq!(job_of(&rows), 0);

        let stats = pool.stats();
        assert_eq!(stats.jobs[0].failed, 1);
        assert_eq!(stats.jobs[0].completed, 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_caller() {
        let factory = FakeFactory::new(2);
        let pool = ConnectionJobPool::open(&factory, &pool_config(2)).await.unwrap();

        let (failed, ok) = tokio::join!(
            pool.query(Batch::new().sql("FAIL")),
            pool.query(Batch::new().sql("SLEEP 5")),
        );
        assert!(failed.is_err());
        assert_eq!(job_of(&ok.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_global_mutex_serializes_all_jobs() {
        let factory = FakeFactory::new(3);
        let config = PoolConfig {
            concurrency: 3,
            use_mutex: true,
            ..Default::default()
        };
        let pool = ConnectionJobPool::open(&factory, &config).await.unwrap();
        assert!(pool.uses_global_mutex());

        let calls = (0..6).map(|_| pool.query(Batch::new().sql("SLEEP 5")));
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }
        assert_eq!(factory.probe.max_total.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let mut factory = FakeFactory::new(3);
        factory.fail_open_at = Some(2);
        let err = ConnectionJobPool::open(&factory, &pool_config(3))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ContendError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let factory = FakeFactory::new(0);
        let err = ConnectionJobPool::open(&factory, &pool_config(0))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ContendError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_serialized_open() {
        let factory = FakeFactory::new(4);
        let concurrent = ConnectionJobPool::open(&factory, &pool_config(4)).await.unwrap();
        assert!(factory.probe.max_opening.load(Ordering::SeqCst) > 1);
        concurrent.shutdown().await.unwrap();

        let factory = FakeFactory::new(4);
        let config = PoolConfig {
            concurrency: 4,
            serialize_open: true,
            ..Default::default()
        };
        let pool = ConnectionJobPool::open(&factory, &config).await.unwrap();
        assert_eq!(factory.probe.max_opening.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 4);
    }

    #[tokio::test]
    async fn test_pool_as_query_channel() {
        let factory = FakeFactory::new(2);
        let pool = ConnectionJobPool::open(&factory, &pool_config(2)).await.unwrap();
        let channel: &dyn QueryChannel = &pool;

        let err = channel.query(Batch::new().sql("FAIL")).await.unwrap_err();
        assert_eq!(err.sql, "FAIL");
        let rows = channel.query(Batch::new().sql("SLEEP 1")).await.unwrap();
        assert_eq!(job_of(&rows), 1);
    }
}
