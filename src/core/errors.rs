// src/core/errors.rs

//! Defines the primary error type for the entire application.
//!
//! Errors are kinds rather than call-site types: `Full`, `Partial`, `Invalid`
//! and friends flow up through the store, state and consensus layers and each
//! layer reacts to the kind, not to where it originated.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
#[derive(Error, Debug)]
pub enum ResqlError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("SQL error: {0}")]
    Sql(Arc<rusqlite::Error>),

    /// The log store cannot take another entry until a snapshot frees a page,
    /// or the disk itself is out of space. The consensus core reacts by
    /// waiting on the in-flight snapshot and retrying.
    #[error("Log store is full")]
    Full,

    /// A complete frame is not available yet. Only ever surfaced by decoders;
    /// the event loop simply waits for more bytes.
    #[error("Incomplete data in stream")]
    Partial,

    /// Malformed message or payload. Treated as peer-fatal: the offending
    /// connection is dropped.
    #[error("Invalid message")]
    Invalid,

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Cluster name mismatch")]
    ClusterNameMismatch,

    #[error("Not the cluster leader")]
    NotLeader,

    #[error("Operation timed out")]
    Timeout,

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecoverable failure (msync, rename, mmap). Data integrity depends on
    /// these operations, so the process aborts when one fails.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ResqlError>;

// Manual Clone because `std::io::Error` and `rusqlite::Error` are not
// cloneable; both are wrapped in an Arc for cheap shared cloning.
impl Clone for ResqlError {
    fn clone(&self) -> Self {
        match self {
            ResqlError::Io(e) => ResqlError::Io(Arc::clone(e)),
            ResqlError::Sql(e) => ResqlError::Sql(Arc::clone(e)),
            ResqlError::Full => ResqlError::Full,
            ResqlError::Partial => ResqlError::Partial,
            ResqlError::Invalid => ResqlError::Invalid,
            ResqlError::Corrupt(s) => ResqlError::Corrupt(s.clone()),
            ResqlError::ClusterNameMismatch => ResqlError::ClusterNameMismatch,
            ResqlError::NotLeader => ResqlError::NotLeader,
            ResqlError::Timeout => ResqlError::Timeout,
            ResqlError::Session(s) => ResqlError::Session(s.clone()),
            ResqlError::Config(s) => ResqlError::Config(s.clone()),
            ResqlError::Fatal(s) => ResqlError::Fatal(s.clone()),
            ResqlError::Internal(s) => ResqlError::Internal(s.clone()),
        }
    }
}

impl ResqlError {
    /// True for errors that must abort the process: continuing after them
    /// would risk serving corrupt state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResqlError::Fatal(_))
    }
}

impl From<std::io::Error> for ResqlError {
    fn from(e: std::io::Error) -> Self {
        ResqlError::Io(Arc::new(e))
    }
}

impl From<rusqlite::Error> for ResqlError {
    fn from(e: rusqlite::Error) -> Self {
        ResqlError::Sql(Arc::new(e))
    }
}

impl From<url::ParseError> for ResqlError {
    fn from(e: url::ParseError) -> Self {
        ResqlError::Config(format!("invalid url: {e}"))
    }
}
