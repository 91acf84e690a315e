//! Routing protocol error kinds

use thiserror::Error;

/// Outcome kinds shared by pre-dispatch checks and adapter acknowledgements
///
/// The same kinds flow verbatim from a domain adapter to the controller, so
/// the type is `Copy` and carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RoutingError {
    /// The requested entity or connection is already present
    #[error("already exists")]
    AlreadyExists,

    /// The request equals the current value; nothing was dispatched
    #[error("no change")]
    NoChange,

    /// The request cannot be carried out right now (no path, pool exhausted)
    #[error("not possible")]
    NotPossible,

    /// The referenced id, handle or connection is not tracked
    #[error("non existent")]
    NonExistent,

    /// The action was aborted before it completed
    #[error("aborted")]
    Aborted,

    /// No compatible connection format
    #[error("wrong format")]
    WrongFormat,

    /// No acknowledgement arrived within the action timeout
    #[error("timed out")]
    Timeout,

    /// Internal inconsistency
    #[error("unknown error")]
    Unknown,

    /// The topology store rejected a write
    #[error("database error")]
    Database,
}

pub type Result<T> = std::result::Result<T, RoutingError>;
