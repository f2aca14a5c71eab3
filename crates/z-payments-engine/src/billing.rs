//! Recurring billing runs.
//!
//! A run charges every active subscription due on or before `as_of`. Charge
//! keys derive from the subscription, its billing period and attempt, so a
//! re-run (or a run resumed after a crash) replays earlier charges instead
//! of issuing new ones. The billing date only moves once a charge is
//! recorded.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use z_payments_core::{
    FailureDisposition, IdempotencyKey, Metadata, PaymentError, PaymentMethodRef,
    PaymentMethodType, Result, Subscription, SubscriptionId, Transaction, TransactionId,
    TransactionType,
};
use z_payments_store::StoreError;

use crate::engine::PaymentEngine;
use crate::transactions::ChargeRequest;

/// Attempts at writing a billing result before giving up on a contended
/// subscription.
const SAVE_ATTEMPTS: usize = 3;

/// A subscription whose charge did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingFailure {
    /// The subscription.
    pub subscription_id: SubscriptionId,
    /// The charge, when one was recorded.
    pub transaction_id: Option<TransactionId>,
    /// What went wrong.
    pub reason: String,
    /// `true` when the failure was transient and did not count as a retry.
    pub retriable: bool,
    /// What the failure did to the subscription, when it counted.
    pub disposition: Option<FailureDisposition>,
}

/// Outcome of a billing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingReport {
    /// Billing date of the run.
    pub as_of: NaiveDate,
    /// Subscriptions selected.
    pub processed: usize,
    /// Charged successfully.
    pub succeeded: usize,
    /// Not charged.
    pub failed: usize,
    /// No longer due when their turn came.
    pub skipped: usize,
    /// One entry per failure.
    pub failures: Vec<BillingFailure>,
}

impl BillingReport {
    fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    fn add(&mut self, outcome: BillingOutcome) {
        self.processed += 1;
        match outcome {
            BillingOutcome::Succeeded => self.succeeded += 1,
            BillingOutcome::Skipped => self.skipped += 1,
            BillingOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

enum BillingOutcome {
    Succeeded,
    Skipped,
    Failed(BillingFailure),
}

/// How a charge attempt ended.
enum Charge {
    Approved(Transaction),
    /// Declined, or rejected before reaching the gateway.
    Refused {
        transaction_id: Option<TransactionId>,
        reason: String,
    },
    /// Transient; the same period and attempt will be tried again.
    Transient {
        transaction_id: Option<TransactionId>,
        reason: String,
    },
}

fn billing_metadata(subscription: &Subscription) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("subscription_id".into(), subscription.id.to_string());
    metadata.insert(
        "billing_period".into(),
        subscription.next_billing_date.to_string(),
    );
    metadata
}

impl PaymentEngine {
    /// Charge active subscriptions due on or before `as_of`, at most
    /// `batch_size` of them.
    ///
    /// Invoked by an external scheduler. A failing subscription never aborts
    /// the run; it is reported in [`BillingReport::failures`].
    ///
    /// # Errors
    ///
    /// Returns `Storage` only if the due list cannot be read.
    pub async fn process_due_billing(
        &self,
        as_of: NaiveDate,
        batch_size: usize,
    ) -> Result<BillingReport> {
        let due = self.store.list_due_subscriptions(as_of, batch_size)?;
        tracing::info!(as_of = %as_of, due = due.len(), "Billing run started");

        let outcomes: Vec<BillingOutcome> = stream::iter(due)
            .map(|subscription| self.bill_subscription(subscription.id, as_of))
            .buffer_unordered(self.config.billing.parallelism.max(1))
            .collect()
            .await;

        let mut report = BillingReport::new(as_of);
        for outcome in outcomes {
            report.add(outcome);
        }

        tracing::info!(
            as_of = %as_of,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Billing run finished"
        );
        Ok(report)
    }

    async fn bill_subscription(&self, id: SubscriptionId, as_of: NaiveDate) -> BillingOutcome {
        // Re-read: the list may be stale by the time this subscription's turn comes.
        let subscription = match self.store.get_subscription(&id) {
            Ok(Some(subscription)) if subscription.is_due(as_of) => subscription,
            Ok(_) => {
                tracing::debug!(subscription_id = %id, "Subscription no longer due");
                return BillingOutcome::Skipped;
            }
            Err(e) => {
                return BillingOutcome::Failed(BillingFailure {
                    subscription_id: id,
                    transaction_id: None,
                    reason: e.to_string(),
                    retriable: true,
                    disposition: None,
                })
            }
        };

        self.limiter.until_key_ready(&subscription.merchant_id).await;

        match self.charge_subscription(&subscription).await {
            Charge::Approved(txn) => self.settle_success(&subscription, &txn),
            Charge::Transient {
                transaction_id,
                reason,
            } => {
                tracing::warn!(
                    subscription_id = %id,
                    reason = %reason,
                    "Billing charge failed transiently, will retry"
                );
                BillingOutcome::Failed(BillingFailure {
                    subscription_id: id,
                    transaction_id,
                    reason,
                    retriable: true,
                    disposition: None,
                })
            }
            Charge::Refused {
                transaction_id,
                reason,
            } => self.settle_failure(&subscription, transaction_id, reason),
        }
    }

    async fn charge_subscription(&self, subscription: &Subscription) -> Charge {
        let refused = |reason: String| Charge::Refused {
            transaction_id: None,
            reason,
        };

        let key = match IdempotencyKey::new(subscription.billing_idempotency_key()) {
            Ok(key) => key,
            Err(e) => return refused(e.to_string()),
        };
        let family = match self.billing_family(subscription) {
            Ok(family) => family,
            Err(e) if e.is_retriable() || matches!(e, PaymentError::Storage(_)) => {
                return Charge::Transient {
                    transaction_id: None,
                    reason: e.to_string(),
                }
            }
            Err(e) => return refused(e.to_string()),
        };

        let request = ChargeRequest {
            customer_id: Some(subscription.customer_id),
            amount_minor: subscription.amount_minor,
            currency: subscription.currency.clone(),
            payment_method: subscription.payment_method.clone(),
            metadata: billing_metadata(subscription),
        };

        match self
            .charge(subscription.merchant_id, &key, TransactionType::Sale, family, request)
            .await
        {
            Ok(processed) if processed.value.is_approved() => Charge::Approved(processed.value),
            Ok(processed) => Charge::Refused {
                transaction_id: Some(processed.value.id),
                reason: processed
                    .value
                    .gateway_response_message
                    .clone()
                    .unwrap_or_else(|| format!("{:?}", processed.value.status)),
            },
            Err(PaymentError::GatewayTimeout { transaction_id }) => Charge::Transient {
                transaction_id: Some(transaction_id),
                reason: "gateway timeout".into(),
            },
            Err(e) if e.is_retriable() || matches!(e, PaymentError::Storage(_)) => {
                Charge::Transient {
                    transaction_id: None,
                    reason: e.to_string(),
                }
            }
            Err(e) => refused(e.to_string()),
        }
    }

    /// Funding family of the subscription's payment method.
    fn billing_family(&self, subscription: &Subscription) -> Result<PaymentMethodType> {
        match &subscription.payment_method {
            PaymentMethodRef::Saved { payment_method_id } => Ok(self
                .load_payment_method(&subscription.merchant_id, payment_method_id)?
                .method_type),
            PaymentMethodRef::OneTime { .. } => Ok(PaymentMethodType::CreditCard),
        }
    }

    fn settle_success(&self, subscription: &Subscription, txn: &Transaction) -> BillingOutcome {
        match self.save_billing_result(subscription, Subscription::record_success) {
            Ok(_) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    transaction_id = %txn.id,
                    period = %subscription.next_billing_date,
                    "Subscription billed"
                );
                BillingOutcome::Succeeded
            }
            Err(e) => {
                // The charge stands; the next run replays it under the same key.
                tracing::error!(
                    subscription_id = %subscription.id,
                    transaction_id = %txn.id,
                    error = %e,
                    "Charged but failed to advance subscription"
                );
                BillingOutcome::Failed(BillingFailure {
                    subscription_id: subscription.id,
                    transaction_id: Some(txn.id),
                    reason: e.to_string(),
                    retriable: true,
                    disposition: None,
                })
            }
        }
    }

    fn settle_failure(
        &self,
        subscription: &Subscription,
        transaction_id: Option<TransactionId>,
        reason: String,
    ) -> BillingOutcome {
        let pause_after = self.config.billing.pause_after_failures;
        let disposition =
            match self.save_billing_result(subscription, |s| s.record_failure(pause_after)) {
                Ok(disposition) => Some(disposition),
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to record billing failure"
                    );
                    None
                }
            };

        tracing::info!(
            subscription_id = %subscription.id,
            transaction_id = ?transaction_id,
            disposition = ?disposition,
            reason = %reason,
            "Subscription charge failed"
        );
        BillingOutcome::Failed(BillingFailure {
            subscription_id: subscription.id,
            transaction_id,
            reason,
            retriable: false,
            disposition,
        })
    }

    /// Apply `record` to the billed subscription and write it back, retrying
    /// on version conflicts while the subscription is still at the billed
    /// period and attempt.
    fn save_billing_result<T>(
        &self,
        billed: &Subscription,
        record: impl Fn(&mut Subscription) -> Result<T>,
    ) -> Result<T> {
        let mut current = billed.clone();
        for _ in 0..SAVE_ATTEMPTS {
            let expected_version = current.version;
            let mut next = current.clone();
            let value = record(&mut next)?;
            match self.store.update_subscription(&next, expected_version) {
                Ok(()) => return Ok(value),
                Err(StoreError::VersionConflict { .. }) => {
                    current = self
                        .store
                        .get_subscription(&billed.id)?
                        .ok_or_else(|| PaymentError::not_found("subscription", billed.id))?;
                    if current.billing_idempotency_key() != billed.billing_idempotency_key() {
                        return Err(PaymentError::StateConflict(format!(
                            "subscription {} moved on during billing",
                            billed.id
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PaymentError::StateConflict(format!(
            "subscription {} kept changing during billing",
            billed.id
        )))
    }
}
