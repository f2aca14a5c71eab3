//! Admin endpoints driven by an external scheduler.
//!
//! Each run takes an optional `as_of` (default: now) and `limit` (default:
//! the configured batch limit).

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use z_payments_engine::{AchReconcileReport, BillingReport, ReconcileSummary};

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Billing run request.
#[derive(Debug, Default, Deserialize)]
pub struct BillingRunRequest {
    /// Billing date to run for.
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Maximum subscriptions to bill.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Sweep request.
#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    /// Reference time of the sweep.
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
    /// Maximum records to examine.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Bill every subscription due on or before `as_of`.
pub async fn run_billing(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    body: Option<Json<BillingRunRequest>>,
) -> Result<Json<BillingReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let as_of = request.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let limit = request.limit.unwrap_or(state.config.batch_limit);

    tracing::info!(admin_id = %auth.admin_id, as_of = %as_of, limit, "Billing run requested");

    let report = state.engine.process_due_billing(as_of, limit).await?;
    Ok(Json(report))
}

/// Settle pending ACH verifications.
pub async fn reconcile_ach(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<AchReconcileReport>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let as_of = request.as_of.unwrap_or_else(Utc::now);
    let limit = request.limit.unwrap_or(state.config.batch_limit);

    tracing::info!(admin_id = %auth.admin_id, as_of = %as_of, limit, "ACH reconciliation requested");

    let report = state.engine.reconcile_ach(as_of, limit).await?;
    Ok(Json(report))
}

/// Resolve ambiguous and stale pending transactions.
pub async fn reconcile_transactions(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let as_of = request.as_of.unwrap_or_else(Utc::now);
    let limit = request.limit.unwrap_or(state.config.batch_limit);

    tracing::info!(admin_id = %auth.admin_id, as_of = %as_of, limit, "Transaction reconciliation requested");

    let summary = state.engine.reconcile_ambiguous(as_of, limit).await?;
    Ok(Json(summary))
}
