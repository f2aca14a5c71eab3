//! API error types and responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use z_payments_core::PaymentError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed request outside the engine's own validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An error raised by the payment engine.
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Payment(err) => {
                let message = err.to_string();
                let retriable = err.is_retriable();
                match err {
                    PaymentError::Validation(_) | PaymentError::InvalidId(_) => {
                        (StatusCode::BAD_REQUEST, "validation_error", message, None)
                    }
                    PaymentError::Declined { code, .. } => (
                        StatusCode::PAYMENT_REQUIRED,
                        "declined",
                        message,
                        Some(serde_json::json!({ "response_code": code })),
                    ),
                    PaymentError::IdempotencyConflict { .. } => (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "idempotency_conflict",
                        message,
                        None,
                    ),
                    PaymentError::RequestInProgress {
                        retry_after_secs, ..
                    } => {
                        retry_after = Some(*retry_after_secs);
                        (
                            StatusCode::CONFLICT,
                            "request_in_progress",
                            message,
                            Some(serde_json::json!({ "retriable": retriable })),
                        )
                    }
                    PaymentError::StateConflict(_) => {
                        (StatusCode::CONFLICT, "state_conflict", message, None)
                    }
                    PaymentError::NotFound { .. } => {
                        (StatusCode::NOT_FOUND, "not_found", message, None)
                    }
                    PaymentError::Forbidden { scope } => (
                        StatusCode::FORBIDDEN,
                        "forbidden",
                        message,
                        Some(serde_json::json!({ "scope": scope })),
                    ),
                    PaymentError::GatewayUnavailable(_) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "gateway_unavailable",
                        message,
                        Some(serde_json::json!({ "retriable": retriable })),
                    ),
                    PaymentError::GatewayTimeout { transaction_id } => (
                        StatusCode::GATEWAY_TIMEOUT,
                        "gateway_timeout",
                        message,
                        Some(serde_json::json!({
                            "transaction_id": transaction_id,
                            "retriable": retriable
                        })),
                    ),
                    PaymentError::Storage(_) | PaymentError::Configuration(_) => {
                        tracing::error!(error = %message, "Internal server error");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "internal_error",
                            "An internal error occurred".to_string(),
                            None,
                        )
                    }
                }
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}
