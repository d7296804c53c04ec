//! The contended write workload.
//!
//! Until the deadline, every iteration runs one immediate-exclusive
//! transaction that bumps the shared counter and appends a log row stamped
//! with the same clock reading that passed the deadline check. After the
//! deadline, rows stamped later than the deadline are trimmed and the log is
//! counted per peer in the same batch that reads the counter.

use contend_core::{
    now_millis, Batch, ContendError, EndTime, PeerId, QueryChannel, Result, ResultSet, SqlValue,
    Tally,
};
use tracing::{debug, info};

/// Creates the tables if needed and resets them for a new run.
pub const RESET_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS kv (key PRIMARY KEY, value);
    REPLACE INTO kv VALUES ('counter', 0);

    CREATE TABLE IF NOT EXISTS log (time, peer_id, count);
    DELETE FROM log;
";

const INCREMENT: &str = "UPDATE kv SET value = value + 1 WHERE key = 'counter'";
const APPEND_LOG: &str =
    "INSERT INTO log VALUES (?1, ?2, (SELECT value FROM kv WHERE key = 'counter'))";
const TRIM_LOG: &str = "DELETE FROM log WHERE time > ?1";
const COUNT_BY_PEER: &str =
    "SELECT peer_id, COUNT(*) FROM log GROUP BY peer_id ORDER BY peer_id";
const READ_COUNTER: &str = "SELECT value FROM kv WHERE key = 'counter'";

/// Outcome of one peer's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    /// Transactions this peer committed before the deadline.
    pub committed: u64,
    /// Reconciled view of every peer's log rows.
    pub tally: Tally,
}

/// Reset the shared tables. Run once per run, before the go broadcast.
pub async fn reset_tables(channel: &dyn QueryChannel) -> Result<()> {
    channel.query(Batch::new().script(RESET_TABLES)).await?;
    debug!("Tables reset");
    Ok(())
}

/// One peer's contention loop over its own connection.
pub struct BenchmarkLoop<'a> {
    channel: &'a dyn QueryChannel,
    peer: &'a PeerId,
}

impl<'a> BenchmarkLoop<'a> {
    pub fn new(channel: &'a dyn QueryChannel, peer: &'a PeerId) -> Self {
        Self { channel, peer }
    }

    /// Commit increments until `end`, then reconcile.
    ///
    /// A failing transaction ends the loop with that error. There is no retry.
    pub async fn run(&self, end: EndTime) -> Result<LoopReport> {
        let mut committed = 0u64;
        loop {
            let now = now_millis();
            if !end.is_before(now) {
                break;
            }
            self.increment(now).await?;
            committed += 1;
        }
        debug!(peer = %self.peer, committed, "Deadline reached");

        let tally = self.tally(end).await?;
        info!(
            peer = %self.peer,
            committed,
            total = tally.total(),
            counter = tally.counter,
            "Run reconciled"
        );
        Ok(LoopReport { committed, tally })
    }

    /// One increment transaction stamped `now`.
    pub async fn increment(&self, now: i64) -> Result<()> {
        let batch = Batch::new()
            .sql("BEGIN IMMEDIATE")
            .sql(INCREMENT)
            .statement(
                APPEND_LOG,
                [SqlValue::Integer(now), SqlValue::from(self.peer.as_str())],
            )
            .sql("COMMIT");
        self.channel.query(batch).await?;
        Ok(())
    }

    /// Trim rows past `end` and count what is left. Idempotent.
    pub async fn tally(&self, end: EndTime) -> Result<Tally> {
        let batch = Batch::new()
            .statement(TRIM_LOG, [end.as_millis()])
            .sql(COUNT_BY_PEER)
            .sql(READ_COUNTER);
        let results = self.channel.query(batch).await?;
        parse_tally(&results)
    }
}

fn parse_tally(results: &[ResultSet]) -> Result<Tally> {
    let [groups, counter] = results else {
        return Err(malformed(format!(
            "expected 2 result sets, got {}",
            results.len()
        )));
    };

    let mut tally = Tally::default();
    for row in &groups.rows {
        let peer = row
            .first()
            .and_then(SqlValue::as_str)
            .ok_or_else(|| malformed("peer_id is not text"))?;
        let count = row
            .get(1)
            .and_then(SqlValue::as_i64)
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| malformed("COUNT(*) is not a count"))?;
        tally.by_peer.insert(PeerId::from(peer), count);
    }

    tally.counter = counter
        .scalar_i64()
        .and_then(|c| u64::try_from(c).ok())
        .ok_or_else(|| malformed("counter row missing"))?;
    Ok(tally)
}

fn malformed(message: impl Into<String>) -> ContendError {
    ContendError::Query(contend_core::QueryError::new(message, COUNT_BY_PEER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contend_core::QueryError;

    /// Answers the reconciliation batch with fixed rows.
    struct Canned(Vec<ResultSet>);

    #[async_trait::async_trait]
    impl QueryChannel for Canned {
        async fn query(&self, _batch: Batch) -> std::result::Result<Vec<ResultSet>, QueryError> {
            Ok(self.0.clone())
        }
    }

    fn groups(rows: &[(&str, i64)]) -> ResultSet {
        ResultSet {
            columns: vec!["peer_id".into(), "COUNT(*)".into()],
            rows: rows
                .iter()
                .map(|(p, c)| vec![SqlValue::from(*p), SqlValue::Integer(*c)])
                .collect(),
        }
    }

    fn counter(value: i64) -> ResultSet {
        ResultSet {
            columns: vec!["value".into()],
            rows: vec![vec![SqlValue::Integer(value)]],
        }
    }

    #[tokio::test]
    async fn test_tally_parses_groups_and_counter() {
        let channel = Canned(vec![groups(&[("a", 3), ("b", 4)]), counter(7)]);
        let peer = PeerId::from("a");
        let tally = BenchmarkLoop::new(&channel, &peer)
            .tally(EndTime::from_millis(0))
            .await
            .unwrap();
        assert_eq!(tally.summary(), "transactions by peer [3,4] => 7");
        assert_eq!(tally.counter, 7);
    }

    #[tokio::test]
    async fn test_tally_rejects_missing_result_set() {
        let channel = Canned(vec![groups(&[])]);
        let peer = PeerId::from("a");
        let err = BenchmarkLoop::new(&channel, &peer)
            .tally(EndTime::from_millis(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ContendError::Query(_)));
    }

    #[tokio::test]
    async fn test_expired_deadline_runs_no_transactions() {
        let channel = Canned(vec![groups(&[]), counter(0)]);
        let peer = PeerId::from("late");
        let report = BenchmarkLoop::new(&channel, &peer)
            .run(EndTime::from_millis(0))
            .await
            .unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.tally.total(), 0);
    }
}
