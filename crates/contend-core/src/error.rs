//! Error types shared by every contend crate.
//!
//! `ContendError` is the single error enum of the workspace. Variants follow
//! the failure taxonomy of a benchmark run:
//!
//! - **`Configuration`**: unknown backend label, zero pool size, invalid log
//!   level. Raised before any connection is opened.
//! - **`Connection`**: a backend failed to open a connection. Fatal for the
//!   peer (or pool) that attempted it; there is no partial success.
//! - **`Query`**: a single statement or transaction failed. Carries the SQL
//!   text so transcript entries show what was being executed.
//! - **`PoolJob`**: a query routed through a connection pool job failed.
//!   The job itself keeps serving later requests.
//! - **`ChannelClosed`**: a bus port or topic went away underneath a peer.
//! - **`Lock`**: the liveness lock manager refused or lost a session.
//!
//! Every variant is both logged and returned to the caller; nothing in the
//! workspace swallows an error.

use thiserror::Error;

/// Convenience alias for results using the workspace error type.
pub type Result<T> = std::result::Result<T, ContendError>;

/// A failed statement or transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (while executing `{sql}`)")]
pub struct QueryError {
    /// Backend error message.
    pub message: String,
    /// SQL text of the statement that failed.
    pub sql: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql: sql.into(),
        }
    }
}

/// Primary error type for contention runs and pooled dispatch.
#[derive(Error, Debug)]
pub enum ContendError {
    /// Configuration is missing, unknown or semantically invalid.
    ///
    /// **Recovery Strategy**: fix the configuration; nothing was opened yet.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// A backend connection could not be opened.
    ///
    /// **Recovery Strategy**: none in-process. The peer is left `Failed` and a
    /// fresh peer has to be started.
    #[error("Connection error ({backend}): {message}")]
    Connection { backend: String, message: String },

    /// A statement or transaction failed.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// A query routed to a pool job failed.
    #[error("Pool job {job} failed: {source}")]
    PoolJob {
        job: usize,
        #[source]
        source: QueryError,
    },

    /// A bus port or topic was closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The liveness lock manager failed.
    #[error("Lock error: {0}")]
    Lock(String),

    /// Filesystem failure (clearing persisted state).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or was cancelled.
    #[error("Task join error: {0}")]
    Join(String),
}

impl ContendError {
    pub fn connection(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// The underlying query failure, if this error carries one.
    pub fn query_error(&self) -> Option<&QueryError> {
        match self {
            ContendError::Query(e) => Some(e),
            ContendError::PoolJob { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Full diagnostic text: the message followed by its source chain.
    ///
    /// Used for transcript entries, which must show everything a stack trace
    /// would.
    pub fn diagnostic(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !text.contains(&cause_text) {
                text.push_str("\n  caused by: ");
                text.push_str(&cause_text);
            }
            source = cause.source();
        }
        text
    }
}

impl From<figment::Error> for ContendError {
    fn from(err: figment::Error) -> Self {
        ContendError::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_job_exposes_query_error() {
        let err = ContendError::PoolJob {
            job: 2,
            source: QueryError::new("database is locked", "BEGIN IMMEDIATE"),
        };
        assert_eq!(err.query_error().map(|e| e.sql.as_str()), Some("BEGIN IMMEDIATE"));
        assert!(err.to_string().starts_with("Pool job 2 failed"));
    }

    #[test]
    fn test_diagnostic_includes_sql() {
        let err = ContendError::Query(QueryError::new("no such table: kv", "UPDATE kv"));
        let text = err.diagnostic();
        assert!(text.contains("no such table: kv"));
        assert!(text.contains("UPDATE kv"));
    }
}
