//! SQLite storage backends.
//!
//! Every [`BackendKind`] maps onto the same file-backed SQLite engine with a
//! different journal mode:
//!
//! | Kind       | `journal_mode` |
//! |------------|----------------|
//! | `rollback` | `DELETE`       |
//! | `wal`      | `WAL`, `synchronous = NORMAL` |
//! | `truncate` | `TRUNCATE`     |
//!
//! Peers share one database file and each open their own connection, so
//! cross-connection locking is SQLite's own file locking. A busy timeout makes
//! a blocked `BEGIN IMMEDIATE` wait instead of failing outright.
//!
//! `is_async` picks where statements run: on the blocking thread pool
//! (`spawn_blocking`) or inline on the calling task.

mod convert;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use contend_core::config::{BackendConfig, BackendKind};
use contend_core::{
    Batch, ConnectionFactory, ContendError, QueryChannel, QueryError, Result, ResultSet,
    Statement,
};
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::convert::{from_value_ref, to_value};

/// File suffixes SQLite may create next to the database.
const SIDE_FILES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Opens SQLite connections for one catalog entry.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    config: BackendConfig,
}

impl SqliteBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn kind(&self) -> BackendKind {
        self.config.kind
    }

    pub fn path(&self) -> &Path {
        &self.config.db_name
    }

    /// The database file and every side file SQLite may leave behind.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.config.db_name.clone()];
        for suffix in SIDE_FILES {
            let mut name = self.config.db_name.clone().into_os_string();
            name.push(suffix);
            files.push(PathBuf::from(name));
        }
        files
    }
}

#[async_trait]
impl ConnectionFactory for SqliteBackend {
    type Connection = SqliteConnection;

    fn label(&self) -> &str {
        &self.config.label
    }

    async fn open(&self, index: usize) -> Result<SqliteConnection> {
        let config = self.config.clone();
        let connection = tokio::task::spawn_blocking(move || open_connection(&config))
            .await
            .map_err(|e| ContendError::Join(e.to_string()))??;

        debug!(
            backend = %self.config.label,
            index,
            path = %self.config.db_name.display(),
            "Opened SQLite connection"
        );
        Ok(SqliteConnection {
            inner: Arc::new(Mutex::new(connection)),
            is_async: self.config.is_async,
        })
    }

    async fn clear(&self) -> Result<()> {
        for file in self.files() {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(path = %file.display(), "Removed database file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(backend = %self.config.label, "Cleared persisted state");
        Ok(())
    }
}

/// Open a connection and apply the backend's pragmas.
fn open_connection(config: &BackendConfig) -> Result<Connection> {
    let fail = |e: rusqlite::Error| ContendError::connection(&config.label, e.to_string());

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(&config.db_name, flags).map_err(fail)?;

    // Before journal_mode: switching to WAL needs a lock other peers may hold.
    connection.busy_timeout(config.busy_timeout()).map_err(fail)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.kind.journal_mode()))
        .map_err(fail)?;
    if config.kind == BackendKind::Wal {
        connection
            .execute_batch("PRAGMA synchronous = NORMAL;")
            .map_err(fail)?;
    }

    for arg in &config.args {
        let (name, value) = arg.split_once('=').ok_or_else(|| {
            ContendError::connection(
                &config.label,
                format!("argument '{}' is not of the form name=value", arg),
            )
        })?;
        connection
            .execute_batch(&format!("PRAGMA {} = {};", name.trim(), value.trim()))
            .map_err(fail)?;
    }
    Ok(connection)
}

/// One open SQLite connection.
///
/// Cloning shares the underlying connection; statements from different clones
/// never interleave within a batch.
#[derive(Clone)]
pub struct SqliteConnection {
    inner: Arc<Mutex<Connection>>,
    is_async: bool,
}

impl SqliteConnection {
    pub fn is_async(&self) -> bool {
        self.is_async
    }
}

#[async_trait]
impl QueryChannel for SqliteConnection {
    async fn query(&self, batch: Batch) -> std::result::Result<Vec<ResultSet>, QueryError> {
        if !self.is_async {
            return run_batch(&self.inner.lock(), &batch);
        }

        let inner = Arc::clone(&self.inner);
        let summary = batch.summary();
        tokio::task::spawn_blocking(move || run_batch(&inner.lock(), &batch))
            .await
            .map_err(|e| QueryError::new(format!("query task failed: {}", e), summary))?
    }
}

/// Execute every statement of `batch` in order, stopping at the first failure.
///
/// A transaction the batch left open is rolled back before the error is
/// returned, so the connection is usable for the next batch.
fn run_batch(
    connection: &Connection,
    batch: &Batch,
) -> std::result::Result<Vec<ResultSet>, QueryError> {
    let mut results = Vec::new();
    for statement in batch.statements() {
        if let Err(e) = run_statement(connection, statement, &mut results) {
            if !connection.is_autocommit() {
                if let Err(rollback) = connection.execute_batch("ROLLBACK") {
                    warn!(error = %rollback, "Rollback after failed statement also failed");
                }
            }
            return Err(QueryError::new(e.to_string(), statement.sql()));
        }
    }
    Ok(results)
}

fn run_statement(
    connection: &Connection,
    statement: &Statement,
    results: &mut Vec<ResultSet>,
) -> rusqlite::Result<()> {
    let (sql, params) = match statement {
        Statement::Script(sql) => return connection.execute_batch(sql),
        Statement::Prepared { sql, params } => (sql, params),
    };

    let mut stmt = connection.prepare_cached(sql)?;
    let values = params_from_iter(params.iter().map(to_value));
    if stmt.column_count() == 0 {
        stmt.execute(values)?;
        return Ok(());
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(values)?;
    let mut set = ResultSet {
        columns,
        rows: Vec::new(),
    };
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(set.columns.len());
        for i in 0..set.columns.len() {
            values.push(from_value_ref(row.get_ref(i)?));
        }
        set.rows.push(values);
    }
    results.push(set);
    Ok(())
}
