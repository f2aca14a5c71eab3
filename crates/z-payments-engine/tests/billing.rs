//! Recurring billing runs.

mod common;

use chrono::{Months, NaiveDate, Utc};

use common::{key, Harness, Reply};
use z_payments_core::{
    BillingInterval, FailureDisposition, FailureOption, Metadata, PaymentMethod,
    PaymentMethodRef, Subscription, SubscriptionStatus, TransactionStatus,
};
use z_payments_engine::CreateSubscriptionRequest;
use z_payments_gateway::TranType;
use z_payments_store::Store;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

async fn subscribe(
    h: &Harness,
    method: &PaymentMethod,
    failure_option: FailureOption,
    max_retries: u32,
) -> Subscription {
    h.engine
        .create_subscription(
            &h.caller,
            &key(&format!("sub-{}", method.id)),
            CreateSubscriptionRequest {
                customer_id: h.customer_id,
                amount_minor: 1999,
                currency: z_payments_core::Currency::usd(),
                interval: BillingInterval::months(1),
                payment_method: PaymentMethodRef::saved(method.id),
                start_date: Some(today()),
                max_retries: Some(max_retries),
                failure_option: Some(failure_option),
                gateway_subscription_id: None,
                metadata: Metadata::new(),
            },
        )
        .await
        .unwrap()
        .value
}

fn reload(h: &Harness, subscription: &Subscription) -> Subscription {
    h.store.get_subscription(&subscription.id).unwrap().unwrap()
}

#[tokio::test]
async fn billing_run_charges_once_and_advances() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 3).await;

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(report.failures.is_empty());

    let billed = reload(&h, &subscription);
    assert_eq!(billed.next_billing_date, today() + Months::new(1));
    assert_eq!(billed.failure_retry_count, 0);

    // Same day again: nothing is due any more.
    let again = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(reload(&h, &subscription).next_billing_date, billed.next_billing_date);
    assert_eq!(h.gateway.submissions_of(TranType::CardSale).len(), 1);

    let charge = &h.store.list_transactions(&h.merchant_id, &Default::default(), 10, 0).unwrap()[0];
    assert_eq!(charge.status, TransactionStatus::Captured);
    assert_eq!(charge.amount_minor, 1999);
    assert_eq!(
        charge.metadata.get("subscription_id").map(String::as_str),
        Some(subscription.id.to_string().as_str())
    );
}

#[tokio::test]
async fn exhausted_retries_make_subscription_past_due() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 3).await;
    h.gateway.script([Reply::Decline; 4]);

    let mut dispositions = Vec::new();
    for _ in 0..4 {
        let report = h.engine.process_due_billing(today(), 100).await.unwrap();
        assert_eq!(report.failed, 1);
        let failure = &report.failures[0];
        assert!(!failure.retriable);
        assert!(failure.transaction_id.is_some());
        dispositions.push(failure.disposition);
    }
    assert_eq!(
        dispositions,
        vec![
            Some(FailureDisposition::WillRetry),
            Some(FailureDisposition::WillRetry),
            Some(FailureDisposition::WillRetry),
            Some(FailureDisposition::PastDue),
        ]
    );

    let past_due = reload(&h, &subscription);
    assert_eq!(past_due.status, SubscriptionStatus::PastDue);
    assert_eq!(past_due.next_billing_date, today());
    assert_eq!(h.gateway.submissions_of(TranType::CardSale).len(), 4);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn unreachable_gateway_does_not_consume_a_retry() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 1).await;
    h.gateway.script([Reply::Unreachable]);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].retriable);
    assert_eq!(report.failures[0].disposition, None);
    assert_eq!(reload(&h, &subscription).failure_retry_count, 0);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(reload(&h, &subscription).next_billing_date, today() + Months::new(1));
}

#[tokio::test]
async fn timed_out_charge_is_resolved_by_next_run() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 3).await;
    h.gateway.script([Reply::TimeoutAfterProcessing]);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].retriable);
    assert_eq!(reload(&h, &subscription).next_billing_date, today());

    // Same key: the next run asks the gateway instead of charging again.
    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(h.gateway.submissions_of(TranType::CardSale).len(), 1);
}

#[tokio::test]
async fn forward_option_moves_the_date_on_failure() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Forward, 3).await;
    h.gateway.script([Reply::Decline]);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(
        report.failures[0].disposition,
        Some(FailureDisposition::Forwarded)
    );

    let forwarded = reload(&h, &subscription);
    assert_eq!(forwarded.status, SubscriptionStatus::Active);
    assert_eq!(forwarded.next_billing_date, today() + Months::new(1));
    assert_eq!(forwarded.failure_retry_count, 1);
}

#[tokio::test]
async fn pause_option_pauses_after_repeated_failures() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Pause, 5).await;
    h.gateway.script([Reply::Decline, Reply::Decline]);

    h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(reload(&h, &subscription).status, SubscriptionStatus::Active);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.failures[0].disposition, Some(FailureDisposition::Paused));
    assert_eq!(reload(&h, &subscription).status, SubscriptionStatus::Paused);
}

#[tokio::test]
async fn inactive_method_counts_as_failure() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 3).await;
    h.engine
        .deactivate_payment_method(&h.caller, &card.id)
        .await
        .unwrap();

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].transaction_id, None);
    assert!(!report.failures[0].retriable);
    assert_eq!(reload(&h, &subscription).failure_retry_count, 1);
    assert!(h.gateway.submissions().is_empty());
}

#[tokio::test]
async fn run_bills_many_subscriptions_independently() {
    let h = Harness::new();
    let mut subscriptions = Vec::new();
    for _ in 0..6 {
        let card = h.saved_card();
        subscriptions.push(subscribe(&h, &card, FailureOption::Skip, 3).await);
    }
    h.gateway.script([Reply::Decline]);

    let report = h.engine.process_due_billing(today(), 100).await.unwrap();
    assert_eq!(report.processed, 6);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failed, 1);

    let report = h.engine.process_due_billing(today(), 2).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn future_subscriptions_are_not_billed() {
    let h = Harness::new();
    let card = h.saved_card();
    let subscription = subscribe(&h, &card, FailureOption::Skip, 3).await;

    let yesterday = today().pred_opt().unwrap();
    let report = h.engine.process_due_billing(yesterday, 100).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(reload(&h, &subscription).next_billing_date, today());
}
