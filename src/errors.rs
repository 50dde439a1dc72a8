//! Unified error types for the academy ledger.
//!
//! Every public operation returns [`Result`]. Validation, state and not-found
//! failures are surfaced to the caller verbatim. Store failures that happen
//! while a multi-row mutation is in flight are reported as
//! [`Error::Transaction`]; the transaction has already been rolled back by the
//! time the caller sees them.

use thiserror::Error;

/// Errors produced by the package allocation and billing engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller supplied an invalid or missing value
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input
        message: String,
    },

    /// The operation is not valid for the entity's current state
    #[error("Invalid state: {message}")]
    State {
        /// Which state rule was violated
        message: String,
    },

    /// A referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind (e.g. `"package"`)
        entity: &'static str,
        /// The id that was looked up
        id: i64,
    },

    /// A payment or billing message could not be dispatched
    #[error("Notification failed: {message}")]
    Notification {
        /// Why the dispatch failed
        message: String,
    },

    /// A multi-row mutation failed and was rolled back
    #[error("Transaction '{operation}' rolled back: {source}")]
    Transaction {
        /// Name of the operation that was rolled back
        operation: &'static str,
        /// Underlying store error
        source: sea_orm::DbErr,
    },

    /// Store failure outside of a mutation
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or malformed environment variable
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// JSON serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::State`] error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::NotFound`] error.
    #[must_use]
    pub const fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Re-labels a raw store error as a rolled-back transaction.
    ///
    /// Typed errors (validation, state, not found) pass through untouched so
    /// callers can still match on them.
    #[must_use]
    pub fn in_transaction(self, operation: &'static str) -> Self {
        match self {
            Self::Database(source) => Self::Transaction { operation, source },
            other => other,
        }
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
