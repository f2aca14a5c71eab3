//! Transaction handlers: charges, follow-ups, reads and on-demand
//! reconciliation.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use z_payments_core::{
    CustomerId, Metadata, Transaction, TransactionFilter, TransactionId, TransactionStatus,
    TransactionType,
};
use z_payments_engine::{AchCreditRequest, ChargeRequest, FollowUpRequest, MAX_PAGE_SIZE};

use crate::auth::{IdempotencyHeader, MerchantAuth};
use crate::error::ApiError;
use crate::handlers::{parse_id, respond};
use crate::state::AppState;

// ============================================================================
// Charges
// ============================================================================

/// Hold funds on a card.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<ChargeRequest>,
) -> Result<Response, ApiError> {
    let processed = state.engine.authorize(&auth.caller, &key, request).await?;
    Ok(respond(processed))
}

/// Charge a card in one step.
pub async fn sale(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<ChargeRequest>,
) -> Result<Response, ApiError> {
    let processed = state.engine.sale(&auth.caller, &key, request).await?;
    Ok(respond(processed))
}

/// Debit a bank account.
pub async fn ach_debit(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<ChargeRequest>,
) -> Result<Response, ApiError> {
    let processed = state.engine.ach_debit(&auth.caller, &key, request).await?;
    Ok(respond(processed))
}

/// Credit a bank account, linked to a debit or standalone.
pub async fn ach_credit(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<AchCreditRequest>,
) -> Result<Response, ApiError> {
    let processed = state.engine.ach_credit(&auth.caller, &key, request).await?;
    Ok(respond(processed))
}

// ============================================================================
// Follow-ups
// ============================================================================

/// Capture an authorization, fully or partially.
pub async fn capture(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
    Json(request): Json<FollowUpRequest>,
) -> Result<Response, ApiError> {
    let parent_id: TransactionId = parse_id(&id)?;
    let processed = state
        .engine
        .capture(&auth.caller, &key, &parent_id, request)
        .await?;
    Ok(respond(processed))
}

/// Void request body.
#[derive(Debug, Default, Deserialize)]
pub struct VoidRequest {
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Void a transaction before settlement. Works for card and ACH parents.
pub async fn void(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
    body: Option<Json<VoidRequest>>,
) -> Result<Response, ApiError> {
    let parent_id: TransactionId = parse_id(&id)?;
    let metadata = body.map(|Json(request)| request.metadata).unwrap_or_default();
    let processed = state
        .engine
        .void(&auth.caller, &key, &parent_id, metadata)
        .await?;
    Ok(respond(processed))
}

/// Refund a captured transaction, fully or partially.
pub async fn refund(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Path(id): Path<String>,
    Json(request): Json<FollowUpRequest>,
) -> Result<Response, ApiError> {
    let parent_id: TransactionId = parse_id(&id)?;
    let processed = state
        .engine
        .refund(&auth.caller, &key, &parent_id, request)
        .await?;
    Ok(respond(processed))
}

/// Ask the gateway what happened to an unresolved transaction.
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, ApiError> {
    let id: TransactionId = parse_id(&id)?;
    let txn = state.engine.reconcile_transaction(&auth.caller, &id).await?;
    Ok(Json(txn))
}

// ============================================================================
// Reads
// ============================================================================

/// Get a transaction.
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<Transaction>, ApiError> {
    let id: TransactionId = parse_id(&id)?;
    let txn = state.engine.get_transaction(&auth.caller, &id).await?;
    Ok(Json(txn))
}

/// A transaction and everything derived from it, oldest first.
pub async fn get_chain(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Path(id): Path<String>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let id: TransactionId = parse_id(&id)?;
    let chain = state.engine.chain(&auth.caller, &id).await?;
    Ok(Json(chain))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Only this customer's transactions.
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    /// Only transactions in this status.
    #[serde(default)]
    pub status: Option<TransactionStatus>,
    /// Only transactions of this type.
    #[serde(default, rename = "type")]
    pub transaction_type: Option<TransactionType>,
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<Transaction>,
    /// Offset of the next page when this one was full.
    pub next_offset: Option<usize>,
}

/// List the merchant's transactions.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    let filter = TransactionFilter {
        customer_id: query.customer_id,
        status: query.status,
        transaction_type: query.transaction_type,
    };
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

    let transactions = state
        .engine
        .list_transactions(&auth.caller, &filter, limit, query.offset)
        .await?;

    let next_offset = (transactions.len() == limit).then_some(query.offset + limit);
    Ok(Json(ListTransactionsResponse {
        transactions,
        next_offset,
    }))
}
