//! Error types for z-payments.
//!
//! A declined payment is *not* an error: it comes back as a transaction with
//! status `Declined`. The `Declined` variant below only exists for operations
//! that have no transaction to return (storing a bank account the gateway
//! refuses to tokenize).

use crate::ids::{IdError, TransactionId};
use crate::money::MoneyError;

/// Result type for z-payments operations.
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Errors that can occur in z-payments operations.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Malformed input. Not retriable.
    #[error("validation error: {0}")]
    Validation(String),

    /// The gateway refused an operation that produces no transaction record.
    #[error("declined by issuer: {code} - {message}")]
    Declined {
        /// Gateway response code.
        code: String,
        /// Gateway response text.
        message: String,
    },

    /// Same idempotency key reused with a different request.
    #[error("idempotency key {key} was already used with a different request")]
    IdempotencyConflict {
        /// The reused key.
        key: String,
    },

    /// Another call holding the same idempotency key has not finished yet.
    #[error("request with idempotency key {key} is still in progress")]
    RequestInProgress {
        /// The contended key.
        key: String,
        /// Seconds until the holder's reservation lease expires.
        retry_after_secs: u64,
    },

    /// The gateway could not be reached. Nothing was recorded.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// The gateway did not answer in time; the transaction is left ambiguous.
    #[error("gateway timeout, transaction {transaction_id} left ambiguous")]
    GatewayTimeout {
        /// The locally recorded transaction awaiting reconciliation.
        transaction_id: TransactionId,
    },

    /// Illegal state transition or amount-limit violation.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Entity not found (or not visible to the calling merchant).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The access collaborator refused the call.
    #[error("forbidden: missing scope {scope}")]
    Forbidden {
        /// Scope that was required.
        scope: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error (missing credentials, bad gateway config).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl PaymentError {
    /// Whether the caller may retry the same request with the same key.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable(_) | Self::GatewayTimeout { .. } | Self::RequestInProgress { .. }
        )
    }

    /// Shorthand for a `NotFound` error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<MoneyError> for PaymentError {
    fn from(err: MoneyError) -> Self {
        Self::Validation(err.to_string())
    }
}
