//! `contend-core`
//!
//! Shared types for the contend workspace: the error taxonomy, the peer and
//! run data model, the query channel capability every backend implements,
//! layered configuration and tracing setup.
//!
//! ## Key Types
//!
//! - [`ContendError`]: workspace-wide error enum
//! - [`QueryChannel`] / [`ConnectionFactory`]: storage capability seam
//! - [`Batch`] / [`ResultSet`]: what goes over a query channel
//! - [`PeerId`], [`EndTime`], [`Tally`], [`LogLine`]: run data model
//! - [`config::ContendConfig`]: Figment-loaded configuration

pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod tracing_init;

pub use error::{ContendError, QueryError, Result};
pub use model::{now_millis, EndTime, LogLine, PeerId, Tally};
pub use query::{Batch, ConnectionFactory, QueryChannel, ResultSet, SqlValue, Statement};
