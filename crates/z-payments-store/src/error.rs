//! Error types for z-payments storage.

use z_payments_core::{PaymentError, TransactionStatus, VerificationStatus};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A unique index already holds this value.
    #[error("duplicate {index}: {value}")]
    DuplicateKey {
        /// Which unique index.
        index: &'static str,
        /// Conflicting value.
        value: String,
    },

    /// Guarded transition found the record in an unexpected status.
    #[error("transaction is {current:?}, cannot move to {requested:?}")]
    StatusConflict {
        /// Status found.
        current: TransactionStatus,
        /// Status requested.
        requested: TransactionStatus,
    },

    /// Guarded verification update found an unexpected status.
    #[error("verification is {current:?}")]
    VerificationConflict {
        /// Status found.
        current: VerificationStatus,
    },

    /// The parent or a sibling rules out the child.
    #[error("chain conflict: {0}")]
    ChainConflict(String),

    /// Inserting a child would exceed the parent's amount.
    #[error("amount limit exceeded: limit={limit}, committed={committed}, requested={requested}")]
    LimitExceeded {
        /// Parent amount.
        limit: i64,
        /// Amount already reserved by siblings.
        committed: i64,
        /// Amount of the rejected child.
        requested: i64,
    },

    /// Optimistic version check failed.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
}

impl StoreError {
    /// Shorthand for `NotFound`.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::StatusConflict { .. }
            | StoreError::VerificationConflict { .. }
            | StoreError::ChainConflict(_)
            | StoreError::LimitExceeded { .. }
            | StoreError::VersionConflict { .. }
            | StoreError::DuplicateKey { .. } => Self::StateConflict(err.to_string()),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Storage(msg),
        }
    }
}
