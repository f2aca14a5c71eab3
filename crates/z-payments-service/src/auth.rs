//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `MerchantAuth` - Merchant application calls via service API key plus the
//!   `x-merchant-id` header set by the upstream identity layer
//! - `AdminAuth` - Admin authentication for scheduler-driven endpoints
//! - `IdempotencyHeader` - The `Idempotency-Key` every mutating call carries

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use z_payments_core::{IdempotencyKey, MerchantId};
use z_payments_engine::Caller;
use z_payments_gateway::crypto::constant_time_eq;

use crate::error::ApiError;
use crate::state::AppState;

/// Header naming the merchant a call acts for.
pub const MERCHANT_ID_HEADER: &str = "x-merchant-id";

/// Header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Check a presented key against the configured one.
fn check_key(presented: Option<&str>, expected: Option<&String>) -> Result<(), ApiError> {
    let presented = presented.ok_or(ApiError::Unauthorized)?;
    let expected = expected.ok_or(ApiError::Unauthorized)?;
    if constant_time_eq(presented, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// An authenticated merchant application.
#[derive(Debug, Clone)]
pub struct MerchantAuth {
    /// Identity handed to the engine.
    pub caller: Caller,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for MerchantAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        check_key(
            header(parts, "x-api-key"),
            state.config.service_api_key.as_ref(),
        )?;

        let merchant_id = header(parts, MERCHANT_ID_HEADER)
            .ok_or(ApiError::Unauthorized)?
            .parse::<MerchantId>()
            .map_err(|_| ApiError::Unauthorized)?;

        let principal = header(parts, "x-service-name").unwrap_or("unknown");

        Ok(MerchantAuth {
            caller: Caller::new(principal, merchant_id),
        })
    }
}

/// Admin authentication via the `X-Admin-Key` header.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        check_key(
            header(parts, "x-admin-key"),
            state.config.admin_api_key.as_ref(),
        )?;

        let admin_id = header(parts, "x-admin-id").unwrap_or("admin").to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(AdminAuth { admin_id })
    }
}

/// The validated `Idempotency-Key` header.
#[derive(Debug, Clone)]
pub struct IdempotencyHeader(pub IdempotencyKey);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for IdempotencyHeader {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = header(parts, IDEMPOTENCY_KEY_HEADER).ok_or_else(|| {
            ApiError::BadRequest("missing Idempotency-Key header".into())
        })?;
        let key = IdempotencyKey::new(raw).map_err(ApiError::from)?;
        Ok(Self(key))
    }
}
