//! Transaction endpoint integration tests.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use serde_json::{json, Value};

fn card_charge(amount_minor: i64) -> Value {
    json!({
        "amount_minor": amount_minor,
        "payment_method": {
            "type": "one_time",
            "token": { "kind": "storage", "value": "tok_visa" }
        }
    })
}

// ============================================================================
// Charges
// ============================================================================

#[tokio::test]
async fn sale_is_created_then_replayed() {
    let harness = TestHarness::new();

    let first = harness
        .post("/v1/transactions/sale", "sale-1")
        .json(&card_charge(2500))
        .await;
    first.assert_status(StatusCode::CREATED);
    let created: Value = first.json();
    assert_eq!(created["status"], "captured");
    assert_eq!(created["amount_minor"], 2500);
    assert!(first.headers().get("idempotent-replayed").is_none());

    let second = harness
        .post("/v1/transactions/sale", "sale-1")
        .json(&card_charge(2500))
        .await;
    second.assert_status_ok();
    assert_eq!(second.headers()["idempotent-replayed"], "true");
    let replayed: Value = second.json();
    assert_eq!(replayed["id"], created["id"]);
    assert_eq!(harness.gateway.submission_count(), 1);
}

#[tokio::test]
async fn reused_key_with_different_body_is_rejected() {
    let harness = TestHarness::new();

    harness
        .post("/v1/transactions/sale", "sale-2")
        .json(&card_charge(2500))
        .await
        .assert_status(StatusCode::CREATED);

    let response = harness
        .post("/v1/transactions/sale", "sale-2")
        .json(&card_charge(9900))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "idempotency_conflict");
}

#[tokio::test]
async fn authorize_capture_refund_chain() {
    let harness = TestHarness::new();

    let auth: Value = harness
        .post("/v1/transactions/authorize", "auth-1")
        .json(&card_charge(5000))
        .await
        .json();
    assert_eq!(auth["status"], "authorized");
    let auth_id = auth["id"].as_str().unwrap().to_string();

    let capture = harness
        .post(&format!("/v1/transactions/{auth_id}/capture"), "cap-1")
        .json(&json!({}))
        .await;
    capture.assert_status(StatusCode::CREATED);
    let capture: Value = capture.json();
    assert_eq!(capture["status"], "captured");
    assert_eq!(capture["amount_minor"], 5000);
    let capture_id = capture["id"].as_str().unwrap().to_string();

    harness
        .post(&format!("/v1/transactions/{capture_id}/refund"), "ref-1")
        .json(&json!({ "amount_minor": 1500 }))
        .await
        .assert_status(StatusCode::CREATED);

    let over = harness
        .post(&format!("/v1/transactions/{capture_id}/refund"), "ref-2")
        .json(&json!({ "amount_minor": 4000 }))
        .await;
    over.assert_status(StatusCode::CONFLICT);
    let body: Value = over.json();
    assert_eq!(body["error"]["code"], "state_conflict");

    let chain: Vec<Value> = harness
        .get(&format!("/v1/transactions/{auth_id}/chain"))
        .await
        .json();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[0]["id"], auth_id.as_str());
}

#[tokio::test]
async fn void_without_body() {
    let harness = TestHarness::new();

    let auth: Value = harness
        .post("/v1/transactions/authorize", "auth-v")
        .json(&card_charge(700))
        .await
        .json();
    let auth_id = auth["id"].as_str().unwrap();

    let response = harness
        .post(&format!("/v1/transactions/{auth_id}/void"), "void-1")
        .await;
    response.assert_status(StatusCode::CREATED);
    let void: Value = response.json();
    assert_eq!(void["transaction_type"], "void");

    let parent: Value = harness
        .get(&format!("/v1/transactions/{auth_id}"))
        .await
        .json();
    assert_eq!(parent["status"], "voided");
}

#[tokio::test]
async fn declined_sale_is_recorded() {
    let harness = TestHarness::new();
    harness.gateway.decline_amount(5100);

    let response = harness
        .post("/v1/transactions/sale", "sale-d")
        .json(&card_charge(5100))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["status"], "declined");
    assert_eq!(body["gateway_response_code"], "05");
}

#[tokio::test]
async fn unreachable_gateway_is_retriable() {
    let harness = TestHarness::new();
    harness.gateway.set_unreachable(true);

    let response = harness
        .post("/v1/transactions/sale", "sale-u")
        .json(&card_charge(800))
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "gateway_unavailable");
    assert_eq!(body["error"]["details"]["retriable"], true);

    harness.gateway.set_unreachable(false);
    harness
        .post("/v1/transactions/sale", "sale-u")
        .json(&card_charge(800))
        .await
        .assert_status(StatusCode::CREATED);
}

#[tokio::test]
async fn invalid_amount_is_a_validation_error() {
    let harness = TestHarness::new();

    let response = harness
        .post("/v1/transactions/sale", "sale-0")
        .json(&card_charge(0))
        .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(harness.gateway.submission_count(), 0);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn list_filters_and_pages() {
    let harness = TestHarness::new();

    for i in 0..3 {
        harness
            .post("/v1/transactions/sale", &format!("sale-l{i}"))
            .json(&card_charge(100 + i))
            .await
            .assert_status(StatusCode::CREATED);
    }
    harness
        .post("/v1/transactions/authorize", "auth-l")
        .json(&card_charge(900))
        .await
        .assert_status(StatusCode::CREATED);

    let sales: Value = harness
        .get("/v1/transactions")
        .add_query_param("type", "sale")
        .await
        .json();
    assert_eq!(sales["transactions"].as_array().unwrap().len(), 3);

    let page: Value = harness
        .get("/v1/transactions")
        .add_query_param("limit", 2)
        .await
        .json();
    assert_eq!(page["transactions"].as_array().unwrap().len(), 2);
    assert_eq!(page["next_offset"], 2);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let harness = TestHarness::new();

    harness
        .get("/v1/transactions/01ARZ3NDEKTSV4RRFFQ69G5FAV")
        .await
        .assert_status_not_found();

    harness
        .get("/v1/transactions/not-an-id")
        .await
        .assert_status_bad_request();
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn missing_or_wrong_api_key_is_unauthorized() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/transactions")
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/transactions")
        .add_header("x-api-key", "wrong-key".to_string())
        .add_header("x-merchant-id", harness.merchant_id.to_string())
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/transactions")
        .add_header("x-api-key", harness.service_api_key.clone())
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn mutations_require_idempotency_key() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/transactions/sale")
        .add_header("x-api-key", harness.service_api_key.clone())
        .add_header("x-merchant-id", harness.merchant_id.to_string())
        .json(&card_charge(2500))
        .await;
    response.assert_status_bad_request();
    assert_eq!(harness.gateway.submission_count(), 0);
}

#[tokio::test]
async fn other_merchants_see_nothing() {
    let harness = TestHarness::new();

    let sale: Value = harness
        .post("/v1/transactions/sale", "sale-p")
        .json(&card_charge(2500))
        .await
        .json();
    let id = sale["id"].as_str().unwrap();

    harness
        .server
        .get(&format!("/v1/transactions/{id}"))
        .add_header("x-api-key", harness.service_api_key.clone())
        .add_header("x-merchant-id", z_payments_core::MerchantId::generate().to_string())
        .await
        .assert_status_not_found();
}
