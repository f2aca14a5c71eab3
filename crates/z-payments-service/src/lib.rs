//! Z-Payments HTTP API Service.
//!
//! Thin HTTP surface over the payment engine:
//!
//! - Card and ACH transactions with their follow-ups
//! - Browser-redirect sessions and the gateway callback
//! - Saved bank accounts and pre-note verification
//! - Subscriptions
//! - Scheduler-driven billing and reconciliation runs
//!
//! # Authentication
//!
//! 1. **Service API key plus merchant id** - merchant applications send
//!    `x-api-key` and the `x-merchant-id` resolved by the upstream identity
//!    layer. Mutating calls also carry an `Idempotency-Key`.
//! 2. **Admin API key** - the scheduler sends `x-admin-key`.
//! 3. **Callbacks** - authenticated by the gateway's MAC over the fields.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Health handler needs async for routing

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::sync::Arc;

use z_payments_engine::{AllowAll, EngineConfig, PaymentEngine, StaticCredentials};
use z_payments_gateway::{GatewayClient, GatewayConfig, GatewayError};
use z_payments_store::Store;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;

/// Wire the production engine: the given store, the HTTP gateway client
/// configured from the environment, file or environment merchant
/// credentials, and merchant-scoped access control.
///
/// # Errors
///
/// Returns a `GatewayError` if the gateway client cannot be built.
pub fn build_engine(
    store: Arc<dyn Store>,
    config: &ServiceConfig,
) -> Result<PaymentEngine, GatewayError> {
    let gateway = GatewayClient::new(GatewayConfig::from_env())?;
    let credentials = StaticCredentials::load(config.credentials_file.as_deref());
    if credentials.is_empty() {
        tracing::warn!("No merchant credentials loaded - every gateway call will fail");
    } else {
        tracing::info!(merchants = credentials.len(), "Merchant credentials loaded");
    }

    Ok(PaymentEngine::new(
        store,
        Arc::new(gateway),
        Arc::new(credentials),
        Arc::new(AllowAll),
        EngineConfig::from_env(),
    ))
}
