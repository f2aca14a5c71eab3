//! Subscription handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;

use z_payments_core::{CustomerId, Subscription, SubscriptionId};
use z_payments_engine::{CreateSubscriptionRequest, UpdateSubscriptionRequest};

use crate::auth::{IdempotencyHeader, MerchantAuth};
use crate::error::ApiError;
use crate::handlers::{parse_id, respond};
use crate::state::AppState;

/// Create a subscription.
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<Response, ApiError> {
    let processed = state
        .engine
        .create_subscription(&auth.caller, &key, request)
        .await?;
    Ok(respond(processed))
}

/// Get a subscription.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<Subscription>, ApiError> {
    let id: SubscriptionId = parse_id(&id)?;
    let subscription = state.engine.get_subscription(&auth.caller, &id).await?;
    Ok(Json(subscription))
}

/// Change a subscription's terms.
pub async fn update_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
    Json(request): Json<UpdateSubscriptionRequest>,
) -> Result<Response, ApiError> {
    let id: SubscriptionId = parse_id(&id)?;
    let processed = state
        .engine
        .update_subscription(&auth.caller, &key, &id, request)
        .await?;
    Ok(respond(processed))
}

/// Cancel a subscription for good.
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: SubscriptionId = parse_id(&id)?;
    let processed = state
        .engine
        .cancel_subscription(&auth.caller, &key, &id)
        .await?;
    Ok(respond(processed))
}

/// Stop billing until resumed.
pub async fn pause_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: SubscriptionId = parse_id(&id)?;
    let processed = state
        .engine
        .pause_subscription(&auth.caller, &key, &id)
        .await?;
    Ok(respond(processed))
}

/// Resume billing.
pub async fn resume_subscription(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: SubscriptionId = parse_id(&id)?;
    let processed = state
        .engine
        .resume_subscription(&auth.caller, &key, &id)
        .await?;
    Ok(respond(processed))
}

/// List a customer's subscriptions.
pub async fn list_customer_subscriptions(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(customer_id): Path<String>,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let customer_id: CustomerId = parse_id(&customer_id)?;
    let subscriptions = state
        .engine
        .list_customer_subscriptions(&auth.caller, &customer_id)
        .await?;
    Ok(Json(subscriptions))
}
