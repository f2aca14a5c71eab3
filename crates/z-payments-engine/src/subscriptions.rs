//! Subscription lifecycle: create, update, cancel, pause, resume.
//!
//! Every write is guarded by the subscription's version counter and runs
//! under the idempotency ledger.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use z_payments_core::{
    validate_amount, validate_metadata, BillingInterval, Currency, CustomerId, FailureOption,
    IdempotencyKey, LedgerResult, MerchantId, Metadata, PaymentError, PaymentMethodRef,
    Processed, RequestFingerprint, Result, Subscription, SubscriptionId, SubscriptionStatus,
    DEFAULT_MAX_RETRIES,
};

use crate::collaborators::{Caller, Scope};
use crate::engine::PaymentEngine;
use crate::ledger::{unexpected_entry, LedgerEntry};
use crate::transactions::{describe_method, describe_metadata};

/// A new subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    /// Billed customer.
    pub customer_id: CustomerId,
    /// Amount per period in minor units.
    pub amount_minor: i64,
    /// Currency (default USD).
    #[serde(default)]
    pub currency: Currency,
    /// Billing interval.
    pub interval: BillingInterval,
    /// Saved payment method owned by the customer.
    pub payment_method: PaymentMethodRef,
    /// First billing date (default: today).
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Failed charges tolerated before going past due.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Behaviour on failure (default: skip).
    #[serde(default)]
    pub failure_option: Option<FailureOption>,
    /// Gateway-side recurring profile, if one exists.
    #[serde(default)]
    pub gateway_subscription_id: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Changes to a subscription. Absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSubscriptionRequest {
    /// New amount per period.
    #[serde(default)]
    pub amount_minor: Option<i64>,
    /// New interval.
    #[serde(default)]
    pub interval: Option<BillingInterval>,
    /// New payment method.
    #[serde(default)]
    pub payment_method: Option<PaymentMethodRef>,
    /// New next billing date.
    #[serde(default)]
    pub next_billing_date: Option<NaiveDate>,
    /// New retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// New failure behaviour.
    #[serde(default)]
    pub failure_option: Option<FailureOption>,
    /// Replacement metadata.
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl LedgerEntry for Subscription {
    fn ledger_result(&self) -> LedgerResult {
        LedgerResult::Subscription(self.id)
    }
}

fn ensure_not_cancelled(subscription: &Subscription) -> Result<()> {
    if subscription.status == SubscriptionStatus::Cancelled {
        return Err(PaymentError::StateConflict(format!(
            "subscription {} is cancelled",
            subscription.id
        )));
    }
    Ok(())
}

impl PaymentEngine {
    /// Create a subscription.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad amounts, intervals or one-time tokens.
    /// - `StateConflict` if the payment method is inactive.
    /// - `NotFound` if the payment method is unknown or another customer's.
    pub async fn create_subscription(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: CreateSubscriptionRequest,
    ) -> Result<Processed<Subscription>> {
        self.check_scope(caller, Scope::SubscriptionsWrite).await?;
        validate_amount(request.amount_minor)?;
        request.interval.validate()?;
        validate_metadata(&request.metadata)?;

        let fingerprint = RequestFingerprint::builder("create_subscription")
            .field("customer", request.customer_id)
            .field("amount", request.amount_minor)
            .field("currency", &request.currency)
            .field("interval", format!("{:?}", request.interval))
            .field("payment_method", describe_method(&request.payment_method))
            .opt_field("start", request.start_date)
            .opt_field("max_retries", request.max_retries)
            .opt_field("failure_option", request.failure_option.map(|o| format!("{o:?}")))
            .opt_field("gateway_subscription", request.gateway_subscription_id.as_deref())
            .field("metadata", describe_metadata(&request.metadata))
            .finish();
        let merchant_id = caller.merchant_id;

        self.run_idempotent(
            &merchant_id,
            key,
            &fingerprint,
            |result| self.replay_subscription(merchant_id, key, result),
            || async move {
                self.check_subscription_method(
                    &merchant_id,
                    &request.customer_id,
                    &request.payment_method,
                )?;

                let now = Utc::now();
                let subscription = Subscription {
                    id: SubscriptionId::generate(),
                    merchant_id,
                    customer_id: request.customer_id,
                    amount_minor: request.amount_minor,
                    currency: request.currency,
                    interval: request.interval,
                    status: SubscriptionStatus::Active,
                    payment_method: request.payment_method,
                    next_billing_date: request.start_date.unwrap_or_else(|| now.date_naive()),
                    failure_retry_count: 0,
                    max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                    failure_option: request.failure_option.unwrap_or(FailureOption::Skip),
                    gateway_subscription_id: request.gateway_subscription_id,
                    metadata: request.metadata,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                    cancelled_at: None,
                };
                self.store.insert_subscription(&subscription)?;

                tracing::info!(
                    subscription_id = %subscription.id,
                    customer_id = %subscription.customer_id,
                    amount_minor = subscription.amount_minor,
                    next_billing_date = %subscription.next_billing_date,
                    "Subscription created"
                );
                Ok(Processed::fresh(subscription))
            },
        )
        .await
    }

    /// Change a subscription. Updating a past-due subscription reactivates it.
    ///
    /// # Errors
    ///
    /// - `StateConflict` for cancelled subscriptions or a concurrent write.
    /// - `Validation` / `NotFound` as for [`PaymentEngine::create_subscription`].
    pub async fn update_subscription(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        id: &SubscriptionId,
        request: UpdateSubscriptionRequest,
    ) -> Result<Processed<Subscription>> {
        if let Some(amount) = request.amount_minor {
            validate_amount(amount)?;
        }
        if let Some(interval) = &request.interval {
            interval.validate()?;
        }
        if let Some(metadata) = &request.metadata {
            validate_metadata(metadata)?;
        }

        let fingerprint = RequestFingerprint::builder("update_subscription")
            .field("subscription", id)
            .opt_field("amount", request.amount_minor)
            .opt_field("interval", request.interval.map(|i| format!("{i:?}")))
            .opt_field("payment_method", request.payment_method.as_ref().map(describe_method))
            .opt_field("next_billing_date", request.next_billing_date)
            .opt_field("max_retries", request.max_retries)
            .opt_field("failure_option", request.failure_option.map(|o| format!("{o:?}")))
            .opt_field("metadata", request.metadata.as_ref().map(describe_metadata))
            .finish();
        let merchant_id = caller.merchant_id;

        self.modify_subscription(caller, key, id, &fingerprint, "update", |subscription| {
            ensure_not_cancelled(subscription)?;
            if let Some(reference) = request.payment_method {
                self.check_subscription_method(&merchant_id, &subscription.customer_id, &reference)?;
                subscription.payment_method = reference;
            }
            if let Some(amount) = request.amount_minor {
                subscription.amount_minor = amount;
            }
            if let Some(interval) = request.interval {
                subscription.interval = interval;
            }
            if let Some(date) = request.next_billing_date {
                subscription.next_billing_date = date;
            }
            if let Some(max_retries) = request.max_retries {
                subscription.max_retries = max_retries;
            }
            if let Some(option) = request.failure_option {
                subscription.failure_option = option;
            }
            if let Some(metadata) = request.metadata {
                subscription.metadata = metadata;
            }
            if subscription.status == SubscriptionStatus::PastDue {
                subscription.status = SubscriptionStatus::Active;
                subscription.failure_retry_count = 0;
            }
            Ok(true)
        })
        .await
    }

    /// Cancel a subscription for good. Cancelling twice is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; `StateConflict` on a concurrent write.
    pub async fn cancel_subscription(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        id: &SubscriptionId,
    ) -> Result<Processed<Subscription>> {
        let fingerprint = RequestFingerprint::builder("cancel_subscription")
            .field("subscription", id)
            .finish();
        self.modify_subscription(caller, key, id, &fingerprint, "cancel", |subscription| {
            if subscription.status == SubscriptionStatus::Cancelled {
                return Ok(false);
            }
            subscription.status = SubscriptionStatus::Cancelled;
            subscription.cancelled_at = Some(Utc::now());
            Ok(true)
        })
        .await
    }

    /// Stop billing an active or past-due subscription.
    ///
    /// # Errors
    ///
    /// `StateConflict` for cancelled subscriptions.
    pub async fn pause_subscription(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        id: &SubscriptionId,
    ) -> Result<Processed<Subscription>> {
        let fingerprint = RequestFingerprint::builder("pause_subscription")
            .field("subscription", id)
            .finish();
        self.modify_subscription(caller, key, id, &fingerprint, "pause", |subscription| {
            ensure_not_cancelled(subscription)?;
            if subscription.status == SubscriptionStatus::Paused {
                return Ok(false);
            }
            subscription.status = SubscriptionStatus::Paused;
            Ok(true)
        })
        .await
    }

    /// Resume a paused subscription. A next billing date already in the past
    /// moves to today.
    ///
    /// # Errors
    ///
    /// `StateConflict` unless the subscription is paused (or already active).
    pub async fn resume_subscription(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        id: &SubscriptionId,
    ) -> Result<Processed<Subscription>> {
        let fingerprint = RequestFingerprint::builder("resume_subscription")
            .field("subscription", id)
            .finish();
        self.modify_subscription(caller, key, id, &fingerprint, "resume", |subscription| {
            match subscription.status {
                SubscriptionStatus::Active => Ok(false),
                SubscriptionStatus::Paused => {
                    let today = Utc::now().date_naive();
                    subscription.status = SubscriptionStatus::Active;
                    subscription.next_billing_date = subscription.next_billing_date.max(today);
                    Ok(true)
                }
                other => Err(PaymentError::StateConflict(format!(
                    "cannot resume subscription {} in status {other:?}",
                    subscription.id
                ))),
            }
        })
        .await
    }

    /// Get one of the caller's subscriptions.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and other merchants' subscriptions.
    pub async fn get_subscription(
        &self,
        caller: &Caller,
        id: &SubscriptionId,
    ) -> Result<Subscription> {
        self.check_scope(caller, Scope::SubscriptionsRead).await?;
        self.load_subscription(&caller.merchant_id, id)
    }

    /// List a customer's subscriptions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn list_customer_subscriptions(
        &self,
        caller: &Caller,
        customer_id: &CustomerId,
    ) -> Result<Vec<Subscription>> {
        self.check_scope(caller, Scope::SubscriptionsRead).await?;
        Ok(self
            .store
            .list_customer_subscriptions(&caller.merchant_id, customer_id)?)
    }

    /// Load, change and write back a subscription under the ledger. `change`
    /// returns `false` when there is nothing to write.
    async fn modify_subscription<F>(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        id: &SubscriptionId,
        fingerprint: &RequestFingerprint,
        operation: &'static str,
        change: F,
    ) -> Result<Processed<Subscription>>
    where
        F: FnOnce(&mut Subscription) -> Result<bool>,
    {
        self.check_scope(caller, Scope::SubscriptionsWrite).await?;
        let merchant_id = caller.merchant_id;

        self.run_idempotent(
            &merchant_id,
            key,
            fingerprint,
            |result| self.replay_subscription(merchant_id, key, result),
            || async move {
                let mut subscription = self.load_subscription(&merchant_id, id)?;
                let expected_version = subscription.version;
                if !change(&mut subscription)? {
                    return Ok(Processed::fresh(subscription));
                }
                subscription.touch();
                self.store.update_subscription(&subscription, expected_version)?;

                tracing::info!(
                    subscription_id = %subscription.id,
                    operation,
                    status = ?subscription.status,
                    version = subscription.version,
                    "Subscription changed"
                );
                Ok(Processed::fresh(subscription))
            },
        )
        .await
    }

    async fn replay_subscription(
        &self,
        merchant_id: MerchantId,
        key: &IdempotencyKey,
        result: LedgerResult,
    ) -> Result<Subscription> {
        match result {
            LedgerResult::Subscription(id) => self.load_subscription(&merchant_id, &id),
            other => Err(unexpected_entry(key, other)),
        }
    }

    /// A subscription must be funded by an active saved method of its customer.
    fn check_subscription_method(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
        reference: &PaymentMethodRef,
    ) -> Result<()> {
        let PaymentMethodRef::Saved { payment_method_id } = reference else {
            return Err(PaymentError::Validation(
                "subscriptions require a saved payment method".into(),
            ));
        };
        let method = self.load_payment_method(merchant_id, payment_method_id)?;
        if method.customer_id != *customer_id {
            return Err(PaymentError::not_found("payment method", payment_method_id));
        }
        if !method.is_active {
            return Err(PaymentError::StateConflict(format!(
                "payment method {payment_method_id} is inactive"
            )));
        }
        Ok(())
    }
}
