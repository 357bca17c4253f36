use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;
use crate::store::Operation;

/// Errors raised by the data layer.
///
/// Only contract violations (`Routing`, `UnsupportedOperation`,
/// `IndexOutOfRange`, `CursorClosed`) are meant to reach callers directly.
/// Everything raised inside a background unit is turned into a failure event
/// carrying a `FailureReason`.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Unknown resource path: {0}")]
    Routing(String),

    #[error("{op} not supported on resource path: {path}")]
    UnsupportedOperation { op: Operation, path: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Local store error: {0}")]
    LocalIo(#[from] rusqlite::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Index {index} out of range for cursor with {count} rows")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Cursor used after close")]
    CursorClosed,

    #[error("Location {0} is part of a parent cycle")]
    TreeCycle(String),

    #[error("Bulk insert into {path} aborted after {inserted} rows: {source}")]
    BulkInsertAborted {
        path: String,
        inserted: usize,
        #[source]
        source: Box<DataError>,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T, E = DataError> = std::result::Result<T, E>;

/// Reason code carried by failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    Unknown,
    ServerError,
    Connectivity,
    NotFound,
    Validation,
    LocalIo,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::Unknown => "unknown",
            FailureReason::ServerError => "server error",
            FailureReason::Connectivity => "connectivity",
            FailureReason::NotFound => "not found",
            FailureReason::Validation => "validation",
            FailureReason::LocalIo => "local i/o",
        };
        f.write_str(s)
    }
}

impl DataError {
    /// Map the error onto the reason code surfaced to event subscribers.
    pub fn reason(&self) -> FailureReason {
        match self {
            DataError::Remote(e) => e.reason(),
            DataError::LocalIo(_)
            | DataError::BulkInsertAborted { .. }
            | DataError::Snapshot(_) => FailureReason::LocalIo,
            DataError::NotFound(_) => FailureReason::NotFound,
            DataError::Validation(_) | DataError::TreeCycle(_) => FailureReason::Validation,
            DataError::Routing(_)
            | DataError::UnsupportedOperation { .. }
            | DataError::IllegalState(_)
            | DataError::IndexOutOfRange { .. }
            | DataError::CursorClosed
            | DataError::Task(_) => FailureReason::Unknown,
        }
    }
}

impl From<tokio::task::JoinError> for DataError {
    fn from(e: tokio::task::JoinError) -> Self {
        DataError::Task(e.to_string())
    }
}
