//! Error types for the coordinator

use shared_types::{IdError, XaException, Xid};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the user-facing transaction API.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Xid is not an active transaction of this coordinator
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(Xid),

    /// Xid was already begun or joined
    #[error("Transaction already active: {0}")]
    DuplicateTransaction(Xid),

    /// Resource name was never registered
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// Resource refused to start the branch
    #[error("Resource {resource} failed to start branch: {source}")]
    ResourceStart {
        resource: String,
        #[source]
        source: XaException,
    },

    /// Peer coordinator could not be reached
    #[error("Peer {server_id} unavailable: {source}")]
    PeerUnavailable {
        server_id: String,
        #[source]
        source: XaException,
    },

    /// Operation does not fit the transaction's role or identity
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Transaction already handed to commit or rollback
    #[error("Transaction closed: {0}")]
    TransactionClosed(Xid),

    /// Identifier could not be built
    #[error("Identifier error: {0}")]
    Id(#[from] IdError),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Terminal failure delivered through a transaction future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Commit was decided but did not complete cleanly
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Rollback did not complete cleanly
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// Coordinator stopped waiting for the outcome
    #[error("Transaction timed out")]
    Timeout,

    /// Coordinator shut down before an outcome was delivered
    #[error("Transaction result dropped")]
    ResultDropped,
}

/// Journal read or write failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    /// Write could not be made durable
    #[error("Journal write failed: {0}")]
    WriteFailed(String),

    /// Query could not be answered
    #[error("Journal query failed: {0}")]
    QueryFailed(String),
}

/// Result type for the user-facing API
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
