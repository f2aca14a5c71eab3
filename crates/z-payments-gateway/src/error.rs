//! Error types for the gateway adapter.
//!
//! A decline is not an error: it is a classified [`GatewayResponse`]. These
//! errors mean no usable answer was obtained.
//!
//! [`GatewayResponse`]: crate::GatewayResponse

use z_payments_core::PaymentError;

/// Errors that can occur talking to the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request never reached the gateway (connection refused, DNS, TLS).
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The request was sent but no answer arrived within the timeout.
    #[error("gateway request timed out")]
    Timeout,

    /// An answer arrived but could not be interpreted.
    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),

    /// The gateway answered with a non-success HTTP status.
    #[error("gateway HTTP error: {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// The gateway refused a request that creates no transaction
    /// (key exchange, account tokenization).
    #[error("gateway rejected request: {code} - {message}")]
    Rejected {
        /// Gateway error code.
        code: String,
        /// Gateway error text.
        message: String,
    },

    /// The operation is not offered for this funding family.
    #[error("unsupported gateway operation: {0}")]
    Unsupported(String),

    /// Adapter configuration is unusable.
    #[error("gateway configuration error: {0}")]
    Configuration(String),

    /// A callback's MAC did not verify.
    #[error("invalid callback signature")]
    InvalidSignature,
}

impl GatewayError {
    /// Whether the gateway may have processed the request even though no
    /// usable answer came back.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        match self {
            Self::Timeout | Self::MalformedResponse(_) => true,
            Self::Http { status } => *status >= 500,
            Self::Unreachable(_)
            | Self::Rejected { .. }
            | Self::Unsupported(_)
            | Self::Configuration(_)
            | Self::InvalidSignature => false,
        }
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_builder() {
            Self::Unreachable(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

impl From<GatewayError> for PaymentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Configuration(msg) => Self::Configuration(msg),
            GatewayError::Rejected { code, message } => Self::Declined { code, message },
            GatewayError::Unsupported(msg) => Self::Validation(msg),
            GatewayError::InvalidSignature => Self::Validation(err.to_string()),
            GatewayError::Unreachable(_)
            | GatewayError::Timeout
            | GatewayError::MalformedResponse(_)
            | GatewayError::Http { .. } => Self::GatewayUnavailable(err.to_string()),
        }
    }
}
