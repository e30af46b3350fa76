//! Error types for the identra domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for all identra operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Both identity fragments absent, or a fragment has the wrong shape.
    /// Raised before any store access.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A cluster was observed without exactly one live primary. Implies a
    /// prior operation already broke the linkage invariants.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Whether retrying the whole resolution may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict(_)))
    }

    /// Stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Store(_) => "store",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Config { .. } => "config",
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// An insert or update that the schema forbids, e.g. a contact with
    /// neither email nor phone. Indicates a resolver bug; never retried.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The rows a write depends on changed underneath the transaction.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}
