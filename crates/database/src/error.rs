//! Database Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Backend errors (`sqlx`, `redis`,
//! `serde_json`) are attached as children of an [`ErrorKind`] frame via
//! `or_raise`, so the category is always what the caller matches on.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A database error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Connection string could not be parsed or failed validation.
    #[display("invalid connection string: {_0}")]
    InvalidConnection(#[error(not(source))] String),
    /// Strict mode was requested and the SQLite file does not exist.
    #[display("database file not found: {}", _0.display())]
    DatabaseNotFound(#[error(not(source))] PathBuf),
    /// Backend could not be opened or reached.
    #[display("could not connect to {_0} backend")]
    Connection(#[error(not(source))] &'static str),
    /// Backend did not answer in time.
    #[display("backend operation timed out")]
    Timeout,
    /// Backend rejected or failed an operation.
    #[display("database error")]
    Database,
    /// Stored data could not be converted to or from its model.
    #[display("invalid stored data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// Stored schema is newer than this build understands.
    #[display("stored schema version {_0} is newer than supported version {_1}")]
    UnsupportedVersion(#[error(not(source))] u32, #[error(not(source))] u32),
    /// An upgrade step failed; the stored version points at the last completed step.
    #[display("schema upgrade from version {_0} failed")]
    Upgrade(#[error(not(source))] u32),
    /// Copying records between backends failed part way through.
    #[display("migration failed while copying {_0}")]
    Migration(#[error(not(source))] &'static str),
    /// The backend handle has already been closed.
    #[display("database connection is closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout | Self::Database)
    }
}
