//! Saved payment methods and bank account verification.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;

use z_payments_core::{AchVerification, CustomerId, PaymentMethod, PaymentMethodId};
use z_payments_engine::{StoreAchAccountRequest, VerifyAchAccountRequest};

use crate::auth::{IdempotencyHeader, MerchantAuth};
use crate::error::ApiError;
use crate::handlers::{parse_id, respond};
use crate::state::AppState;

/// Tokenize and save a bank account, then send its pre-note.
pub async fn store_ach_account(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<StoreAchAccountRequest>,
) -> Result<Response, ApiError> {
    let processed = state
        .engine
        .store_ach_account(&auth.caller, &key, request)
        .await?;
    Ok(respond(processed))
}

/// Send a pre-note for an account without saving it.
pub async fn verify_ach_account(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<VerifyAchAccountRequest>,
) -> Result<Response, ApiError> {
    let processed = state
        .engine
        .verify_ach_account(&auth.caller, &key, request)
        .await?;
    Ok(respond(processed))
}

/// Get a saved payment method.
pub async fn get_payment_method(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<PaymentMethod>, ApiError> {
    let id: PaymentMethodId = parse_id(&id)?;
    let method = state.engine.get_payment_method(&auth.caller, &id).await?;
    Ok(Json(method))
}

/// Get the pre-note verification of a saved bank account.
pub async fn get_verification(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<AchVerification>, ApiError> {
    let id: PaymentMethodId = parse_id(&id)?;
    let verification = state.engine.get_ach_verification(&auth.caller, &id).await?;
    Ok(Json(verification))
}

/// Deactivate a saved payment method. Repeating the call is harmless.
pub async fn deactivate_payment_method(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<PaymentMethod>, ApiError> {
    let id: PaymentMethodId = parse_id(&id)?;
    let method = state
        .engine
        .deactivate_payment_method(&auth.caller, &id)
        .await?;
    Ok(Json(method))
}

/// List a customer's saved payment methods.
pub async fn list_customer_payment_methods(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(customer_id): Path<String>,
) -> Result<Json<Vec<PaymentMethod>>, ApiError> {
    let customer_id: CustomerId = parse_id(&customer_id)?;
    let methods = state
        .engine
        .list_payment_methods(&auth.caller, &customer_id)
        .await?;
    Ok(Json(methods))
}
