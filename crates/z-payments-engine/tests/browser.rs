//! Browser-redirect payments: declaration, callbacks and stale sessions.

mod common;

use chrono::{Duration, Utc};

use common::{approved, card_charge, declined, key, Harness};
use z_payments_core::{
    PaymentError, PaymentMethodType, TransactionId, TransactionNumber, TransactionStatus,
};
use z_payments_engine::{BrowserPaymentRequest, CallbackOutcome};
use z_payments_gateway::{fields, BrowserOperation, CallbackFields};

fn browser_request(
    amount_minor: i64,
    tokenize: bool,
    customer: Option<z_payments_core::CustomerId>,
) -> BrowserPaymentRequest {
    BrowserPaymentRequest {
        customer_id: customer,
        amount_minor,
        currency: z_payments_core::Currency::usd(),
        operation: BrowserOperation::Sale,
        tokenize,
        return_url: "https://shop.test/checkout/done".into(),
        metadata: z_payments_core::Metadata::new(),
    }
}

#[tokio::test]
async fn declaration_records_pending_transaction_with_form() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_1"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;

    assert_eq!(session.transaction.status, TransactionStatus::Pending);
    assert_eq!(session.form.post_url, "https://gateway.test/browserpost");
    let number = session.transaction.transaction_number.to_string();
    assert_eq!(session.form.fields[fields::TAC], format!("tac-{number}"));
    assert_eq!(session.form.fields[fields::TRAN_NBR], number);
    assert!(session.expires_at > Utc::now());
    assert!(h.gateway.submissions().is_empty());
}

#[tokio::test]
async fn declaration_replays_same_session() {
    let h = Harness::new();
    let first = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_2"), browser_request(4200, false, None))
        .await
        .unwrap();
    let second = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_2"), browser_request(4200, false, None))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(first.value.transaction.id, second.value.transaction.id);
    assert_eq!(first.value.form, second.value.form);
}

#[tokio::test]
async fn declaration_skips_a_number_already_in_use() {
    use z_payments_store::Store;

    let h = Harness::new();
    let preferred = TransactionNumber::derive(&h.merchant_id, "web_n");
    let mut squatter = h
        .engine
        .sale(&h.caller, &key("sale_n"), card_charge(100))
        .await
        .unwrap()
        .value;
    squatter.id = TransactionId::generate();
    squatter.idempotency_key = "sale_n2".into();
    squatter.transaction_number = preferred.clone();
    h.store.insert_transaction(&mut squatter).unwrap();
    assert_eq!(squatter.transaction_number, preferred);

    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_n"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.clone();
    assert_eq!(number, TransactionNumber::derive_attempt(&h.merchant_id, "web_n", 1));
    assert_eq!(session.form.fields[fields::TAC], format!("tac-{number}"));

    let callback = h.callback(
        &number,
        &[("AUTH_RESP", "00"), ("AUTH_RESP_TEXT", "APPROVAL"), ("AUTH_GUID", "guid-web-n")],
    );
    let ack = h.engine.resolve_callback(&h.merchant_id, &callback).await;
    assert_eq!(ack.outcome, CallbackOutcome::Resolved);
    assert_eq!(ack.transaction_id, Some(session.transaction.id));
}

#[tokio::test]
async fn tokenize_without_customer_is_rejected() {
    let h = Harness::new();
    let err = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_3"), browser_request(4200, true, None))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));
}

#[tokio::test]
async fn rejected_key_exchange_records_nothing() {
    let h = Harness::new();
    h.gateway.set_reject_key_exchange(true);

    let err = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_4"), browser_request(4200, false, None))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Declined { .. }));

    let listed = h
        .engine
        .list_transactions(&h.caller, &Default::default(), 10, 0)
        .await
        .unwrap();
    assert!(listed.is_empty());
}

// ============================================================================
// Callbacks
// ============================================================================

#[tokio::test]
async fn approved_callback_saves_card_and_redirects() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(
            &h.caller,
            &key("web_5"),
            browser_request(4200, true, Some(h.customer_id)),
        )
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.clone();

    let callback = h.callback(
        &number,
        &[
            ("AUTH_RESP", "00"),
            ("AUTH_RESP_TEXT", "APPROVAL"),
            ("AUTH_GUID", "guid-web-5"),
            ("AUTH_AMOUNT", "42.00"),
            ("STORAGE_TOKEN", "stor-web-5"),
            ("LAST_FOUR", "1111"),
            ("CARD_BRAND", "VISA"),
        ],
    );
    let ack = h.engine.resolve_callback(&h.merchant_id, &callback).await;

    assert_eq!(ack.outcome, CallbackOutcome::Resolved);
    assert_eq!(ack.status, Some(TransactionStatus::Captured));
    let redirect = ack.redirect_url.unwrap();
    assert!(redirect.starts_with("https://shop.test/checkout/done?"));
    assert!(redirect.contains("status=captured"));
    assert!(redirect.contains(&format!("transaction_id={}", session.transaction.id)));
    assert!(redirect.contains("response_code=00"));

    let methods = h
        .engine
        .list_payment_methods(&h.caller, &h.customer_id)
        .await
        .unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].method_type, PaymentMethodType::CreditCard);
    assert_eq!(methods[0].storage_token, "stor-web-5");
    assert_eq!(methods[0].last_four, "1111");

    let txn = h
        .engine
        .get_transaction(&h.caller, &session.transaction.id)
        .await
        .unwrap();
    assert_eq!(txn.gateway_transaction_id.as_deref(), Some("guid-web-5"));
}

#[tokio::test]
async fn declined_callback_saves_nothing() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(
            &h.caller,
            &key("web_6"),
            browser_request(4200, true, Some(h.customer_id)),
        )
        .await
        .unwrap()
        .value;

    let callback = h.callback(
        &session.transaction.transaction_number,
        &[("AUTH_RESP", "05"), ("AUTH_RESP_TEXT", "DO NOT HONOR")],
    );
    let ack = h.engine.resolve_callback(&h.merchant_id, &callback).await;

    assert_eq!(ack.outcome, CallbackOutcome::Resolved);
    assert_eq!(ack.status, Some(TransactionStatus::Declined));
    assert!(h
        .engine
        .list_payment_methods(&h.caller, &h.customer_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn duplicate_callback_changes_nothing() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_7"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.clone();

    let first = h.callback(&number, &[("AUTH_RESP", "00"), ("AUTH_GUID", "g1")]);
    let ack = h.engine.resolve_callback(&h.merchant_id, &first).await;
    assert_eq!(ack.outcome, CallbackOutcome::Resolved);

    let late_decline = h.callback(&number, &[("AUTH_RESP", "05")]);
    let ack = h.engine.resolve_callback(&h.merchant_id, &late_decline).await;
    assert_eq!(ack.outcome, CallbackOutcome::Duplicate);
    assert_eq!(ack.status, Some(TransactionStatus::Captured));
}

#[tokio::test]
async fn callback_for_unknown_number() {
    let h = Harness::new();
    let number = z_payments_core::TransactionNumber::derive(&h.merchant_id, "never-declared");
    let callback = h.callback(&number, &[("AUTH_RESP", "00")]);

    let ack = h.engine.resolve_callback(&h.merchant_id, &callback).await;
    assert_eq!(ack.outcome, CallbackOutcome::UnknownTransaction);
    assert_eq!(ack.transaction_id, None);
}

#[tokio::test]
async fn callback_with_bad_signature_is_ignored() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_8"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.to_string();

    let forged = CallbackFields::from_pairs([
        (fields::TRAN_NBR, number.as_str()),
        (fields::AUTH_RESP, "00"),
        (fields::MAC, "00ff00ff"),
    ]);
    let ack = h.engine.resolve_callback(&h.merchant_id, &forged).await;
    assert_eq!(ack.outcome, CallbackOutcome::InvalidSignature);

    let txn = h
        .engine
        .get_transaction(&h.caller, &session.transaction.id)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn callback_without_result_is_malformed() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_9"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;

    let callback = h.callback(&session.transaction.transaction_number, &[("AUTH_GUID", "g")]);
    let ack = h.engine.resolve_callback(&h.merchant_id, &callback).await;
    assert_eq!(ack.outcome, CallbackOutcome::Malformed);
    assert_eq!(ack.status, Some(TransactionStatus::Pending));
}

#[tokio::test]
async fn callback_for_unconfigured_merchant_reports_error() {
    let h = Harness::new();
    let number = z_payments_core::TransactionNumber::derive(&h.merchant_id, "x");
    let callback = h.callback(&number, &[("AUTH_RESP", "00")]);

    let ack = h
        .engine
        .resolve_callback(&z_payments_core::MerchantId::generate(), &callback)
        .await;
    assert_eq!(ack.outcome, CallbackOutcome::Error);
}

// ============================================================================
// Stale sessions
// ============================================================================

#[tokio::test]
async fn stale_session_resolved_from_gateway_status() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_10"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.clone();
    h.gateway.mark_processed(&number, approved(&number, 4200));

    // Not yet past expiry plus grace.
    let early = h.engine.reconcile_ambiguous(Utc::now(), 100).await.unwrap();
    assert_eq!(early.examined, 0);

    let summary = h
        .engine
        .reconcile_ambiguous(session.expires_at + Duration::hours(1), 100)
        .await
        .unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.resolved, 1);

    let txn = h
        .engine
        .get_transaction(&h.caller, &session.transaction.id)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Captured);
}

#[tokio::test]
async fn stale_session_the_gateway_never_saw_fails() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_11"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;

    let summary = h
        .engine
        .reconcile_ambiguous(session.expires_at + Duration::hours(1), 100)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let txn = h
        .engine
        .get_transaction(&h.caller, &session.transaction.id)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);

    // A late callback is acknowledged but changes nothing.
    let number = session.transaction.transaction_number.clone();
    let late = h.callback(&number, &[("AUTH_RESP", "00")]);
    let ack = h.engine.resolve_callback(&h.merchant_id, &late).await;
    assert_eq!(ack.outcome, CallbackOutcome::Duplicate);
    assert_eq!(ack.status, Some(TransactionStatus::Failed));
}

#[tokio::test]
async fn declined_status_settles_stale_session() {
    let h = Harness::new();
    let session = h
        .engine
        .begin_browser_payment(&h.caller, &key("web_12"), browser_request(4200, false, None))
        .await
        .unwrap()
        .value;
    let number = session.transaction.transaction_number.clone();
    h.gateway.mark_processed(&number, declined(&number));

    let txn = h
        .engine
        .reconcile_transaction(&h.caller, &session.transaction.id)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Declined);
}
