//! Query channel capability.
//!
//! A [`QueryChannel`] accepts a [`Batch`] of parameterized statements and
//! returns one [`ResultSet`] per statement that produced result columns. The
//! benchmark loop and the connection pool both talk to storage exclusively
//! through this trait; neither knows which backend sits behind it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// A dynamically typed SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// One statement of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// A single statement with positional parameters (`?1`, `?2`, ...).
    Prepared { sql: String, params: Vec<SqlValue> },
    /// Several parameterless statements separated by `;`, executed as-is.
    /// Never produces result sets.
    Script(String),
}

impl Statement {
    pub fn sql(&self) -> &str {
        match self {
            Statement::Prepared { sql, .. } => sql,
            Statement::Script(sql) => sql,
        }
    }
}

/// An ordered list of statements executed on one connection, back to back.
///
/// If any statement fails the remaining ones are skipped, and a transaction
/// left open by the batch is rolled back by the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    statements: Vec<Statement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement with positional parameters.
    pub fn statement<I, V>(mut self, sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.statements.push(Statement::Prepared {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Append a parameterless statement.
    pub fn sql(self, sql: impl Into<String>) -> Self {
        self.statement(sql, Vec::<SqlValue>::new())
    }

    /// Append a multi-statement script.
    pub fn script(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(Statement::Script(sql.into()));
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Compact one-line rendering used in log fields.
    pub fn summary(&self) -> String {
        self.statements
            .iter()
            .map(|s| s.sql().split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Rows produced by one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    /// First column of the first row as an integer.
    pub fn scalar_i64(&self) -> Option<i64> {
        self.rows.first()?.first()?.as_i64()
    }
}

/// An open connection able to execute batches.
#[async_trait]
pub trait QueryChannel: Send + Sync {
    /// Execute `batch` and return the result sets of row-producing statements.
    async fn query(&self, batch: Batch) -> std::result::Result<Vec<ResultSet>, QueryError>;
}

#[async_trait]
impl<T: QueryChannel + ?Sized> QueryChannel for Arc<T> {
    async fn query(&self, batch: Batch) -> std::result::Result<Vec<ResultSet>, QueryError> {
        (**self).query(batch).await
    }
}

/// Opens connections to one logical database.
///
/// Implementations form a closed set selected from configuration (see
/// [`crate::config::BackendKind`]); callers never look backends up by name.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: QueryChannel + 'static;

    /// Label used in logs and connection errors.
    fn label(&self) -> &str;

    /// Open connection number `index`.
    async fn open(&self, index: usize) -> Result<Self::Connection>;

    /// Remove every piece of persisted state this factory would open.
    async fn clear(&self) -> Result<()>;
}
