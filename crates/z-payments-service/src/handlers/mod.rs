//! HTTP request handlers.

pub mod admin;
pub mod browser;
pub mod health;
pub mod payment_methods;
pub mod subscriptions;
pub mod transactions;

use std::str::FromStr;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use z_payments_core::{IdError, PaymentError, Processed};

use crate::error::ApiError;

/// Response header set when an idempotent call replayed a stored result.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Answer an idempotent call: `201 Created` the first time, `200 OK` with
/// [`REPLAYED_HEADER`] on replays.
pub(crate) fn respond<T: Serialize>(processed: Processed<T>) -> Response {
    if processed.replayed {
        let mut response = (StatusCode::OK, Json(processed.value)).into_response();
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
        response
    } else {
        (StatusCode::CREATED, Json(processed.value)).into_response()
    }
}

/// Parse an identifier taken from the path.
pub(crate) fn parse_id<T>(raw: &str) -> Result<T, ApiError>
where
    T: FromStr<Err = IdError>,
{
    raw.parse::<T>()
        .map_err(|e| ApiError::from(PaymentError::from(e)))
}
