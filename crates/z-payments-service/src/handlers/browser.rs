//! Browser-redirect payment handlers.
//!
//! The session endpoint declares a payment and returns the form the
//! merchant renders. The callback endpoint is called by the gateway after
//! the customer submits that form; it always acknowledges with a success
//! status so the gateway does not retry, and sends the browser back to the
//! merchant's page when one is known.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;

use z_payments_core::MerchantId;
use z_payments_engine::{BrowserPaymentRequest, CallbackAck, CallbackOutcome};
use z_payments_gateway::CallbackFields;

use crate::auth::{IdempotencyHeader, MerchantAuth};
use crate::error::ApiError;
use crate::handlers::respond;
use crate::state::AppState;

/// Declare a browser payment.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    auth: MerchantAuth,
    IdempotencyHeader(key): IdempotencyHeader,
    Json(request): Json<BrowserPaymentRequest>,
) -> Result<Response, ApiError> {
    let processed = state
        .engine
        .begin_browser_payment(&auth.caller, &key, request)
        .await?;
    Ok(respond(processed))
}

/// Gateway callback for `merchant_id`, carrying a form-encoded body.
///
/// The body is taken as raw bytes so that a body that is not UTF-8 is still
/// acknowledged, as `Malformed`.
pub async fn gateway_callback(
    State(state): State<Arc<AppState>>,
    Path(merchant_id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(merchant_id) = merchant_id.parse::<MerchantId>() else {
        tracing::warn!(merchant_id = %merchant_id, "Callback for malformed merchant id");
        return Json(bare_ack(CallbackOutcome::UnknownTransaction)).into_response();
    };
    if std::str::from_utf8(&body).is_err() {
        tracing::warn!(merchant_id = %merchant_id, len = body.len(), "Callback body is not UTF-8");
        return Json(bare_ack(CallbackOutcome::Malformed)).into_response();
    }

    let fields = CallbackFields::from_pairs(url::form_urlencoded::parse(&body));
    let ack = state.engine.resolve_callback(&merchant_id, &fields).await;

    tracing::info!(
        merchant_id = %merchant_id,
        outcome = ?ack.outcome,
        transaction_id = ?ack.transaction_id,
        "Gateway callback acknowledged"
    );

    match &ack.redirect_url {
        Some(url) => Redirect::to(url).into_response(),
        None => Json(ack).into_response(),
    }
}

fn bare_ack(outcome: CallbackOutcome) -> CallbackAck {
    CallbackAck {
        outcome,
        transaction_id: None,
        status: None,
        response_code: None,
        redirect_url: None,
    }
}
