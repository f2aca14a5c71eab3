//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, browser, health, payment_methods, subscriptions, transactions};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for merchant API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent admin runs. Each run fans out to the gateway itself.
const ADMIN_MAX_CONCURRENT_REQUESTS: usize = 2;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Transactions (service key + merchant id)
/// - `POST /v1/transactions/authorize` - Hold funds on a card
/// - `POST /v1/transactions/sale` - Charge a card
/// - `POST /v1/transactions/ach/debit` - Debit a bank account
/// - `POST /v1/transactions/ach/credit` - Credit a bank account
/// - `POST /v1/transactions/:id/{capture,void,refund}` - Follow-ups
/// - `POST /v1/transactions/:id/reconcile` - Query the gateway now
/// - `GET /v1/transactions/:id` - Get a transaction
/// - `GET /v1/transactions/:id/chain` - Transaction and its children
/// - `GET /v1/transactions` - List transactions
///
/// ## Browser payments
/// - `POST /v1/browser/sessions` - Declare a browser payment
///
/// ## Payment methods
/// - `POST /v1/ach/accounts` - Save and verify a bank account
/// - `POST /v1/ach/verify` - Verify a bank account without saving it
/// - `GET /v1/payment-methods/:id` - Get a saved method
/// - `DELETE /v1/payment-methods/:id` - Deactivate a saved method
/// - `GET /v1/payment-methods/:id/verification` - Pre-note verification
/// - `GET /v1/customers/:customer_id/payment-methods` - List saved methods
///
/// ## Subscriptions
/// - `POST /v1/subscriptions` - Create
/// - `GET|PATCH /v1/subscriptions/:id` - Get or update
/// - `POST /v1/subscriptions/:id/{cancel,pause,resume}` - Lifecycle
/// - `GET /v1/customers/:customer_id/subscriptions` - List
///
/// ## Admin (admin key)
/// - `POST /v1/admin/billing/run` - Bill due subscriptions
/// - `POST /v1/admin/ach/reconcile` - Settle ACH verifications
/// - `POST /v1/admin/transactions/reconcile` - Resolve ambiguous transactions
///
/// ## Gateway callbacks (MAC verification)
/// - `POST /callbacks/gateway/:merchant_id` - Browser payment result
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let admin_routes = Router::new()
        .route("/billing/run", post(admin::run_billing))
        .route("/ach/reconcile", post(admin::reconcile_ach))
        .route(
            "/transactions/reconcile",
            post(admin::reconcile_transactions),
        )
        .layer(ConcurrencyLimitLayer::new(ADMIN_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Transactions
        .route("/transactions", get(transactions::list_transactions))
        .route("/transactions/authorize", post(transactions::authorize))
        .route("/transactions/sale", post(transactions::sale))
        .route("/transactions/ach/debit", post(transactions::ach_debit))
        .route("/transactions/ach/credit", post(transactions::ach_credit))
        .route("/transactions/:id", get(transactions::get_transaction))
        .route("/transactions/:id/chain", get(transactions::get_chain))
        .route("/transactions/:id/capture", post(transactions::capture))
        .route("/transactions/:id/void", post(transactions::void))
        .route("/transactions/:id/refund", post(transactions::refund))
        .route("/transactions/:id/reconcile", post(transactions::reconcile))
        // Browser payments
        .route("/browser/sessions", post(browser::create_session))
        // Payment methods
        .route("/ach/accounts", post(payment_methods::store_ach_account))
        .route("/ach/verify", post(payment_methods::verify_ach_account))
        .route(
            "/payment-methods/:id",
            get(payment_methods::get_payment_method)
                .delete(payment_methods::deactivate_payment_method),
        )
        .route(
            "/payment-methods/:id/verification",
            get(payment_methods::get_verification),
        )
        .route(
            "/customers/:customer_id/payment-methods",
            get(payment_methods::list_customer_payment_methods),
        )
        // Subscriptions
        .route("/subscriptions", post(subscriptions::create_subscription))
        .route(
            "/subscriptions/:id",
            get(subscriptions::get_subscription).patch(subscriptions::update_subscription),
        )
        .route(
            "/subscriptions/:id/cancel",
            post(subscriptions::cancel_subscription),
        )
        .route(
            "/subscriptions/:id/pause",
            post(subscriptions::pause_subscription),
        )
        .route(
            "/subscriptions/:id/resume",
            post(subscriptions::resume_subscription),
        )
        .route(
            "/customers/:customer_id/subscriptions",
            get(subscriptions::list_customer_subscriptions),
        )
        // Admin routes (with their own concurrency limit)
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Gateway callbacks (no rate limit - controlled by the gateway)
        .route(
            "/callbacks/gateway/:merchant_id",
            post(browser::gateway_callback),
        )
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
