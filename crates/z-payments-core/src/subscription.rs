//! Recurring billing subscriptions.
//!
//! The billing engine mutates subscriptions only through `record_success`
//! and `record_failure`, which keep the date/retry bookkeeping in one place.

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::ids::{CustomerId, MerchantId, SubscriptionId};
use crate::money::Currency;
use crate::transaction::{Metadata, PaymentMethodRef};

/// Default number of failed attempts tolerated before a subscription goes past due.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unit of a billing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    /// Days.
    Day,
    /// Weeks.
    Week,
    /// Calendar months (clamped to month end).
    Month,
    /// Calendar years.
    Year,
}

/// How often a subscription bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInterval {
    /// Number of units, at least one.
    pub count: u32,
    /// Unit.
    pub unit: IntervalUnit,
}

impl BillingInterval {
    /// Every `count` months.
    #[must_use]
    pub const fn months(count: u32) -> Self {
        Self {
            count,
            unit: IntervalUnit::Month,
        }
    }

    /// Every `count` days.
    #[must_use]
    pub const fn days(count: u32) -> Self {
        Self {
            count,
            unit: IntervalUnit::Day,
        }
    }

    /// Reject zero-length intervals.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Validation` when `count` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(PaymentError::Validation(
                "billing interval must be at least one unit".into(),
            ));
        }
        Ok(())
    }

    /// The date one interval after `date`.
    ///
    /// Month and year steps land on the last day of the month when the day
    /// does not exist (Jan 31 + 1 month = Feb 28/29).
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Validation` if the result is out of calendar range.
    pub fn advance(&self, date: NaiveDate) -> Result<NaiveDate> {
        let next = match self.unit {
            IntervalUnit::Day => date.checked_add_days(Days::new(u64::from(self.count))),
            IntervalUnit::Week => date.checked_add_days(Days::new(u64::from(self.count) * 7)),
            IntervalUnit::Month => date.checked_add_months(Months::new(self.count)),
            IntervalUnit::Year => self
                .count
                .checked_mul(12)
                .and_then(|months| date.checked_add_months(Months::new(months))),
        };
        next.ok_or_else(|| PaymentError::Validation("billing date out of range".into()))
    }
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Billed automatically.
    Active,
    /// Not billed until resumed.
    Paused,
    /// Terminal.
    Cancelled,
    /// Retries exhausted; excluded from billing until manually updated.
    PastDue,
}

/// What to do with the billing date when a charge fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOption {
    /// Advance the billing date anyway; the missed charge is not retried.
    Forward,
    /// Keep the billing date so the same period is retried next run.
    Skip,
    /// Pause the subscription once the failure threshold is reached.
    Pause,
}

/// Outcome of recording a failed charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// The billing date moved forward.
    Forwarded,
    /// The same period will be retried.
    WillRetry,
    /// The subscription was paused.
    Paused,
    /// Retries are exhausted; the subscription is past due.
    PastDue,
}

/// A recurring charge against a customer's payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription ID.
    pub id: SubscriptionId,
    /// Owning merchant.
    pub merchant_id: MerchantId,
    /// Billed customer.
    pub customer_id: CustomerId,
    /// Amount per period in minor units.
    pub amount_minor: i64,
    /// Currency.
    pub currency: Currency,
    /// Billing interval.
    pub interval: BillingInterval,
    /// Current status.
    pub status: SubscriptionStatus,
    /// Funding instrument.
    pub payment_method: PaymentMethodRef,
    /// Next date a charge is due.
    pub next_billing_date: NaiveDate,
    /// Consecutive failed charges.
    pub failure_retry_count: u32,
    /// Failed charges tolerated before going past due.
    pub max_retries: u32,
    /// Behaviour on failure.
    pub failure_option: FailureOption,
    /// Gateway-side recurring profile, when one exists.
    pub gateway_subscription_id: Option<String>,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: u64,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When the subscription was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the subscription was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Whether the engine should charge this subscription on `as_of`.
    #[must_use]
    pub fn is_due(&self, as_of: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Active && self.next_billing_date <= as_of
    }

    /// Deterministic idempotency key for the current billing attempt.
    ///
    /// Re-running a batch for the same period and attempt produces the same
    /// key, so a charge can never be issued twice.
    #[must_use]
    pub fn billing_idempotency_key(&self) -> String {
        format!(
            "billing:{}:{}:{}",
            self.id, self.next_billing_date, self.failure_retry_count
        )
    }

    /// Record a successful charge: advance one interval and clear failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the next date is out of calendar range.
    pub fn record_success(&mut self) -> Result<()> {
        self.next_billing_date = self.interval.advance(self.next_billing_date)?;
        self.failure_retry_count = 0;
        self.touch();
        Ok(())
    }

    /// Record a failed charge and apply the failure option.
    ///
    /// Exhausting `max_retries` wins over every option.
    ///
    /// # Errors
    ///
    /// Returns an error if the next date is out of calendar range.
    pub fn record_failure(&mut self, pause_after_failures: u32) -> Result<FailureDisposition> {
        self.failure_retry_count = self.failure_retry_count.saturating_add(1);
        self.touch();

        if self.failure_retry_count > self.max_retries {
            self.status = SubscriptionStatus::PastDue;
            return Ok(FailureDisposition::PastDue);
        }

        match self.failure_option {
            FailureOption::Forward => {
                self.next_billing_date = self.interval.advance(self.next_billing_date)?;
                Ok(FailureDisposition::Forwarded)
            }
            FailureOption::Skip => Ok(FailureDisposition::WillRetry),
            FailureOption::Pause => {
                if self.failure_retry_count >= pause_after_failures.max(1) {
                    self.status = SubscriptionStatus::Paused;
                    Ok(FailureDisposition::Paused)
                } else {
                    Ok(FailureDisposition::WillRetry)
                }
            }
        }
    }

    /// Bump the version and update timestamp.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PaymentMethodId;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn subscription(option: FailureOption, max_retries: u32) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::generate(),
            merchant_id: MerchantId::generate(),
            customer_id: CustomerId::generate(),
            amount_minor: 1999,
            currency: Currency::usd(),
            interval: BillingInterval::months(1),
            status: SubscriptionStatus::Active,
            payment_method: PaymentMethodRef::saved(PaymentMethodId::generate()),
            next_billing_date: date(2024, 1, 31),
            failure_retry_count: 0,
            max_retries,
            failure_option: option,
            gateway_subscription_id: None,
            metadata: Metadata::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        }
    }

    #[test]
    fn month_advance_clamps_to_month_end() {
        let interval = BillingInterval::months(1);
        assert_eq!(interval.advance(date(2024, 1, 31)).unwrap(), date(2024, 2, 29));
        assert_eq!(interval.advance(date(2023, 1, 31)).unwrap(), date(2023, 2, 28));

        let yearly = BillingInterval {
            count: 1,
            unit: IntervalUnit::Year,
        };
        assert_eq!(yearly.advance(date(2024, 2, 29)).unwrap(), date(2025, 2, 28));

        let weekly = BillingInterval {
            count: 2,
            unit: IntervalUnit::Week,
        };
        assert_eq!(weekly.advance(date(2024, 1, 1)).unwrap(), date(2024, 1, 15));
    }

    #[test]
    fn zero_interval_is_invalid() {
        assert!(BillingInterval::days(0).validate().is_err());
        assert!(BillingInterval::days(1).validate().is_ok());
    }

    #[test]
    fn success_advances_and_resets() {
        let mut sub = subscription(FailureOption::Skip, 3);
        sub.failure_retry_count = 2;
        sub.record_success().unwrap();
        assert_eq!(sub.next_billing_date, date(2024, 2, 29));
        assert_eq!(sub.failure_retry_count, 0);
        assert_eq!(sub.version, 1);
    }

    #[test]
    fn skip_keeps_date_until_exhausted() {
        let mut sub = subscription(FailureOption::Skip, 3);
        for _ in 0..3 {
            assert_eq!(sub.record_failure(2).unwrap(), FailureDisposition::WillRetry);
            assert_eq!(sub.next_billing_date, date(2024, 1, 31));
        }
        assert_eq!(sub.record_failure(2).unwrap(), FailureDisposition::PastDue);
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert!(!sub.is_due(date(2030, 1, 1)));
    }

    #[test]
    fn forward_advances_on_failure() {
        let mut sub = subscription(FailureOption::Forward, 3);
        assert_eq!(sub.record_failure(2).unwrap(), FailureDisposition::Forwarded);
        assert_eq!(sub.next_billing_date, date(2024, 2, 29));
        assert_eq!(sub.failure_retry_count, 1);
    }

    #[test]
    fn pause_after_threshold() {
        let mut sub = subscription(FailureOption::Pause, 5);
        assert_eq!(sub.record_failure(2).unwrap(), FailureDisposition::WillRetry);
        assert_eq!(sub.record_failure(2).unwrap(), FailureDisposition::Paused);
        assert_eq!(sub.status, SubscriptionStatus::Paused);
    }

    #[test]
    fn past_due_wins_over_pause() {
        let mut sub = subscription(FailureOption::Pause, 0);
        assert_eq!(sub.record_failure(3).unwrap(), FailureDisposition::PastDue);
    }

    #[test]
    fn billing_key_changes_with_attempt_and_period() {
        let mut sub = subscription(FailureOption::Skip, 3);
        let first = sub.billing_idempotency_key();
        assert_eq!(first, sub.billing_idempotency_key());

        sub.record_failure(2).unwrap();
        let retry = sub.billing_idempotency_key();
        assert_ne!(first, retry);

        sub.record_success().unwrap();
        assert_ne!(retry, sub.billing_idempotency_key());
    }
}
