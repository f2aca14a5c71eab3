//! Saved payment methods and ACH pre-note verification records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::ids::{CustomerId, MerchantId, PaymentMethodId, TransactionId};
use crate::transaction::PaymentMethodType;

/// Kind of bank account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchAccountType {
    /// Checking account.
    Checking,
    /// Savings account.
    Savings,
}

/// A payment method saved for reuse, represented by a gateway storage token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Payment method ID.
    pub id: PaymentMethodId,
    /// Owning merchant.
    pub merchant_id: MerchantId,
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Card or ACH.
    pub method_type: PaymentMethodType,
    /// Durable gateway storage token.
    pub storage_token: String,
    /// Last four digits of the card or account number.
    pub last_four: String,
    /// Card brand as reported by the gateway.
    pub card_brand: Option<String>,
    /// Bank account kind, for ACH methods.
    pub ach_account_type: Option<AchAccountType>,
    /// Inactive methods cannot be charged.
    pub is_active: bool,
    /// Cards are verified on tokenization; ACH accounts once the pre-note clears.
    pub is_verified: bool,
    /// When the method was saved.
    pub created_at: DateTime<Utc>,
    /// When the method was last updated.
    pub updated_at: DateTime<Utc>,
}

impl PaymentMethod {
    /// Whether the method may fund a new charge.
    #[must_use]
    pub const fn is_chargeable(&self, require_verified_ach: bool) -> bool {
        self.is_active
            && (self.is_verified
                || !require_verified_ach
                || !matches!(self.method_type, PaymentMethodType::Ach))
    }
}

/// Raw bank account details as submitted by the caller.
///
/// Only ever forwarded to the gateway; records keep the last four digits.
#[derive(Clone, Serialize, Deserialize)]
pub struct AchAccountDetails {
    /// ABA routing number (9 digits).
    pub routing_number: String,
    /// Account number.
    pub account_number: String,
    /// Checking or savings.
    pub account_type: AchAccountType,
    /// Name on the account.
    pub account_holder: String,
}

impl AchAccountDetails {
    /// Validate routing checksum and account number shape.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Validation` describing the problem.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_routing_number(&self.routing_number) {
            return Err(PaymentError::Validation("invalid routing number".into()));
        }
        let len = self.account_number.len();
        if !(4..=17).contains(&len) || !self.account_number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PaymentError::Validation(
                "account number must be 4-17 digits".into(),
            ));
        }
        if self.account_holder.trim().is_empty() {
            return Err(PaymentError::Validation("account holder is required".into()));
        }
        Ok(())
    }

    /// Last four digits of the account number.
    #[must_use]
    pub fn last_four(&self) -> String {
        let digits = &self.account_number;
        digits[digits.len().saturating_sub(4)..].to_string()
    }
}

impl std::fmt::Debug for AchAccountDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AchAccountDetails")
            .field("routing_number", &self.routing_number)
            .field("account_number", &format!("****{}", self.last_four()))
            .field("account_type", &self.account_type)
            .finish_non_exhaustive()
    }
}

/// ABA routing number checksum (weights 3, 7, 1).
#[must_use]
pub fn is_valid_routing_number(routing: &str) -> bool {
    if routing.len() != 9 || !routing.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let weights = [3, 7, 1, 3, 7, 1, 3, 7, 1];
    let sum: u32 = routing
        .bytes()
        .zip(weights)
        .map(|(b, w)| u32::from(b - b'0') * w)
        .sum();
    sum % 10 == 0
}

/// Status of an ACH pre-note verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Pre-note sent, waiting out the bank turnaround window.
    Pending,
    /// No return received; the account is good.
    Verified,
    /// The bank returned the pre-note.
    Failed,
}

/// Pre-note verification of a saved bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchVerification {
    /// The verified payment method.
    pub payment_method_id: PaymentMethodId,
    /// Owning merchant.
    pub merchant_id: MerchantId,
    /// Current status. Always starts `Pending`.
    pub status: VerificationStatus,
    /// The pre-note transaction.
    pub transaction_id: TransactionId,
    /// Return code reported by the bank, for failed verifications.
    pub return_code: Option<String>,
    /// When the pre-note was sent.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl AchVerification {
    /// Start a new pending verification.
    #[must_use]
    pub fn pending(
        payment_method_id: PaymentMethodId,
        merchant_id: MerchantId,
        transaction_id: TransactionId,
    ) -> Self {
        let now = Utc::now();
        Self {
            payment_method_id,
            merchant_id,
            status: VerificationStatus::Pending,
            transaction_id,
            return_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(routing: &str, account: &str) -> AchAccountDetails {
        AchAccountDetails {
            routing_number: routing.into(),
            account_number: account.into(),
            account_type: AchAccountType::Checking,
            account_holder: "Jane Doe".into(),
        }
    }

    #[test]
    fn routing_checksum() {
        assert!(is_valid_routing_number("021000021"));
        assert!(is_valid_routing_number("011000015"));
        assert!(!is_valid_routing_number("021000022"));
        assert!(!is_valid_routing_number("02100002"));
    }

    #[test]
    fn account_details_validation() {
        assert!(details("021000021", "123456789").validate().is_ok());
        assert!(details("021000021", "12").validate().is_err());
        assert!(details("021000021", "12345abc").validate().is_err());
        assert!(details("123456789", "123456789").validate().is_err());
    }

    #[test]
    fn debug_masks_account_number() {
        let rendered = format!("{:?}", details("021000021", "123456789"));
        assert!(rendered.contains("****6789"));
        assert!(!rendered.contains("123456789"));
    }

    #[test]
    fn unverified_ach_is_not_chargeable_when_required() {
        let now = Utc::now();
        let method = PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: MerchantId::generate(),
            customer_id: CustomerId::generate(),
            method_type: PaymentMethodType::Ach,
            storage_token: "tok".into(),
            last_four: "6789".into(),
            card_brand: None,
            ach_account_type: Some(AchAccountType::Checking),
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
        };
        assert!(!method.is_chargeable(true));
        assert!(method.is_chargeable(false));
    }
}
