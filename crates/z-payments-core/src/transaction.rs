//! Transactions and the state machine that governs them.
//!
//! A transaction is the canonical record of one attempted gateway operation.
//! Follow-up operations (capture, refund, void) are separate child records
//! that point at their parent through `parent_transaction_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result};
use crate::idempotency::RequestFingerprint;
use crate::ids::{CustomerId, MerchantId, PaymentMethodId, TransactionId, TransactionNumber};
use crate::money::Currency;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of metadata entries on a record.
pub const MAX_METADATA_ENTRIES: usize = 50;

/// Maximum length of a metadata key.
pub const MAX_METADATA_KEY_LEN: usize = 40;

/// Maximum length of a metadata value.
pub const MAX_METADATA_VALUE_LEN: usize = 500;

/// Free-form string metadata attached to transactions and subscriptions.
pub type Metadata = BTreeMap<String, String>;

/// Check metadata against the size bounds.
///
/// # Errors
///
/// Returns `PaymentError::Validation` when any bound is exceeded.
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(PaymentError::Validation(format!(
            "metadata has {} entries, maximum is {MAX_METADATA_ENTRIES}",
            metadata.len()
        )));
    }
    for (key, value) in metadata {
        if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
            return Err(PaymentError::Validation(format!(
                "metadata key {key:?} must be 1-{MAX_METADATA_KEY_LEN} characters"
            )));
        }
        if value.len() > MAX_METADATA_VALUE_LEN {
            return Err(PaymentError::Validation(format!(
                "metadata value for {key:?} exceeds {MAX_METADATA_VALUE_LEN} characters"
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Recorded locally, gateway outcome not known yet.
    Pending,
    /// Funds held.
    Authorized,
    /// Funds settled (or queued for settlement).
    Captured,
    /// Cancelled before settlement.
    Voided,
    /// Settled funds returned.
    Refunded,
    /// The issuer or gateway declined the operation. Terminal.
    Declined,
    /// The operation definitively did not happen. Terminal.
    Failed,
    /// The request was sent but no usable answer came back; the gateway may
    /// or may not have processed it. Resolved by reconciliation.
    Ambiguous,
}

impl TransactionStatus {
    /// Whether `self -> next` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TransactionStatus::{
            Ambiguous, Authorized, Captured, Declined, Failed, Pending, Refunded, Voided,
        };
        matches!(
            (self, next),
            (
                Pending,
                Authorized | Captured | Voided | Refunded | Declined | Failed | Ambiguous
            ) | (
                Ambiguous,
                Pending | Authorized | Captured | Voided | Refunded | Declined | Failed
            ) | (Authorized, Voided)
                | (Captured, Voided | Refunded)
        )
    }

    /// Whether the outcome of the gateway call is still unknown.
    #[must_use]
    pub const fn is_unresolved(self) -> bool {
        matches!(self, Self::Pending | Self::Ambiguous)
    }

    /// Whether a child in this status reserves part of its parent's amount.
    #[must_use]
    pub const fn counts_against_limit(self) -> bool {
        !matches!(self, Self::Declined | Self::Failed)
    }

    /// Whether the gateway approved the operation.
    #[must_use]
    pub const fn is_approved(self) -> bool {
        matches!(
            self,
            Self::Authorized | Self::Captured | Self::Voided | Self::Refunded
        )
    }

    /// Wire name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Voided => "voided",
            Self::Refunded => "refunded",
            Self::Declined => "declined",
            Self::Failed => "failed",
            Self::Ambiguous => "ambiguous",
        }
    }
}

/// The operation a transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Hold funds.
    Authorization,
    /// Settle held funds, fully or partially.
    Capture,
    /// Authorization and capture in one step.
    Sale,
    /// Return settled funds, fully or partially.
    Refund,
    /// Cancel before settlement.
    Void,
    /// ACH pre-note.
    Verification,
}

impl TransactionType {
    /// Status the record reaches when the gateway approves it.
    ///
    /// Verifications stay `Pending` until the bank turnaround window passes.
    #[must_use]
    pub const fn approved_status(self) -> TransactionStatus {
        match self {
            Self::Authorization => TransactionStatus::Authorized,
            Self::Capture | Self::Sale => TransactionStatus::Captured,
            Self::Refund => TransactionStatus::Refunded,
            Self::Void => TransactionStatus::Voided,
            Self::Verification => TransactionStatus::Pending,
        }
    }

    /// Whether cumulative amounts of this child type are bounded by the parent.
    #[must_use]
    pub const fn is_amount_bounded(self) -> bool {
        matches!(self, Self::Capture | Self::Refund)
    }

    /// Check that `parent` is a legal parent for a child of this type.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::StateConflict` naming the violated rule.
    pub fn check_parent(self, parent: &Transaction) -> Result<()> {
        let ok = match self {
            Self::Capture => {
                parent.transaction_type == Self::Authorization
                    && parent.status == TransactionStatus::Authorized
            }
            Self::Void => {
                matches!(
                    parent.transaction_type,
                    Self::Authorization | Self::Sale | Self::Capture
                ) && matches!(
                    parent.status,
                    TransactionStatus::Authorized | TransactionStatus::Captured
                )
            }
            Self::Refund => {
                matches!(parent.transaction_type, Self::Sale | Self::Capture)
                    && parent.status == TransactionStatus::Captured
            }
            Self::Authorization | Self::Sale | Self::Verification => {
                return Err(PaymentError::Validation(format!(
                    "{self:?} does not take a parent transaction"
                )));
            }
        };

        if ok {
            Ok(())
        } else {
            Err(PaymentError::StateConflict(format!(
                "cannot {} a {:?} transaction in status {:?}",
                self.verb(),
                parent.transaction_type,
                parent.status
            )))
        }
    }

    /// Lower-case verb used in messages and gateway logs.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Authorization => "authorize",
            Self::Capture => "capture",
            Self::Sale => "sell",
            Self::Refund => "refund",
            Self::Void => "void",
            Self::Verification => "verify",
        }
    }
}

/// Funding instrument family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    /// Card payments.
    CreditCard,
    /// Bank account (ACH) payments.
    Ach,
}

/// A token issued by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GatewayToken {
    /// One-time reference to a completed authorization, used for follow-ups.
    Financial(String),
    /// Durable reference to a saved payment method.
    Storage(String),
}

impl GatewayToken {
    /// The raw token value.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Financial(v) | Self::Storage(v) => v,
        }
    }
}

/// How a transaction is funded: a saved method or a one-time gateway token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethodRef {
    /// A payment method saved for the customer.
    Saved {
        /// The saved method.
        payment_method_id: PaymentMethodId,
    },
    /// A token obtained by the browser flow for this charge only.
    OneTime {
        /// The gateway token.
        token: GatewayToken,
    },
}

impl PaymentMethodRef {
    /// Reference a saved payment method.
    #[must_use]
    pub const fn saved(payment_method_id: PaymentMethodId) -> Self {
        Self::Saved { payment_method_id }
    }

    /// Reference a one-time gateway token.
    #[must_use]
    pub const fn one_time(token: GatewayToken) -> Self {
        Self::OneTime { token }
    }
}

/// Browser-redirect context of a transaction awaiting its gateway callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserContext {
    /// Short-lived authorization code issued by the key exchange.
    pub authorization_code: String,
    /// When the authorization code stops being accepted.
    pub expires_at: DateTime<Utc>,
    /// Merchant page the browser is sent back to.
    pub return_url: String,
    /// Whether the gateway should return a storage token.
    pub tokenize: bool,
}

// ============================================================================
// Transaction
// ============================================================================

/// The canonical record of one attempted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID.
    pub id: TransactionId,
    /// Owning merchant.
    pub merchant_id: MerchantId,
    /// Customer, if known.
    pub customer_id: Option<CustomerId>,
    /// Amount in minor units. Zero only for verifications.
    pub amount_minor: i64,
    /// Currency.
    pub currency: Currency,
    /// Current status.
    pub status: TransactionStatus,
    /// Operation.
    pub transaction_type: TransactionType,
    /// Card or ACH.
    pub payment_method_type: PaymentMethodType,
    /// Funding instrument. `None` until a browser payment is resolved.
    pub payment_method: Option<PaymentMethodRef>,
    /// Number the gateway knows this transaction by.
    pub transaction_number: TransactionNumber,
    /// Gateway-side transaction reference (financial token).
    pub gateway_transaction_id: Option<String>,
    /// Gateway response code.
    pub gateway_response_code: Option<String>,
    /// Gateway response text.
    pub gateway_response_message: Option<String>,
    /// Issuer authorization code.
    pub gateway_auth_code: Option<String>,
    /// Caller-supplied idempotency key.
    pub idempotency_key: String,
    /// Fingerprint of the request that created the record. Outlives the
    /// ledger entry, so a key reused after retention still cannot pick up
    /// a different request's result.
    pub request_fingerprint: RequestFingerprint,
    /// Parent in the authorization -> capture -> refund/void chain.
    pub parent_transaction_id: Option<TransactionId>,
    /// Browser-redirect context, for transactions created by a key exchange.
    pub browser: Option<BrowserContext>,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether the gateway approved this transaction.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        self.status.is_approved()
    }

    /// The financial token follow-up operations reference.
    #[must_use]
    pub fn financial_token(&self) -> Option<GatewayToken> {
        self.gateway_transaction_id
            .clone()
            .map(GatewayToken::Financial)
    }

    /// Check that a request reusing this record's key is the same request.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::IdempotencyConflict` when the fingerprints differ.
    pub fn check_fingerprint(&self, fingerprint: &RequestFingerprint) -> Result<()> {
        if self.request_fingerprint == *fingerprint {
            Ok(())
        } else {
            Err(PaymentError::IdempotencyConflict {
                key: self.idempotency_key.clone(),
            })
        }
    }
}

/// The fields a status transition writes alongside the new status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayResult {
    /// Gateway transaction reference (financial token).
    pub gateway_transaction_id: Option<String>,
    /// Response code.
    pub response_code: Option<String>,
    /// Response text.
    pub response_message: Option<String>,
    /// Issuer authorization code.
    pub auth_code: Option<String>,
}

impl Transaction {
    /// Apply a gateway result onto the record (does not change status).
    pub fn apply_gateway_result(&mut self, result: &GatewayResult) {
        if result.gateway_transaction_id.is_some() {
            self.gateway_transaction_id.clone_from(&result.gateway_transaction_id);
        }
        if result.response_code.is_some() {
            self.gateway_response_code.clone_from(&result.response_code);
        }
        if result.response_message.is_some() {
            self.gateway_response_message.clone_from(&result.response_message);
        }
        if result.auth_code.is_some() {
            self.gateway_auth_code.clone_from(&result.auth_code);
        }
    }
}

/// Filter for listing a merchant's transactions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    /// Only this customer's transactions.
    pub customer_id: Option<CustomerId>,
    /// Only transactions in this status.
    pub status: Option<TransactionStatus>,
    /// Only transactions of this type.
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    /// Whether `txn` passes the filter.
    #[must_use]
    pub fn matches(&self, txn: &Transaction) -> bool {
        self.customer_id.map_or(true, |c| txn.customer_id == Some(c))
            && self.status.map_or(true, |s| txn.status == s)
            && self
                .transaction_type
                .map_or(true, |t| txn.transaction_type == t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(transaction_type: TransactionType, status: TransactionStatus) -> Transaction {
        let merchant_id = MerchantId::generate();
        let now = Utc::now();
        Transaction {
            id: TransactionId::generate(),
            merchant_id,
            customer_id: None,
            amount_minor: 1000,
            currency: Currency::usd(),
            status,
            transaction_type,
            payment_method_type: PaymentMethodType::CreditCard,
            payment_method: None,
            transaction_number: TransactionNumber::derive(&merchant_id, "k"),
            gateway_transaction_id: Some("guid".into()),
            gateway_response_code: None,
            gateway_response_message: None,
            gateway_auth_code: None,
            idempotency_key: "k".into(),
            request_fingerprint: RequestFingerprint::builder("test").finish(),
            parent_transaction_id: None,
            browser: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn state_machine_edges() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Authorized));
        assert!(Pending.can_transition_to(Ambiguous));
        assert!(Ambiguous.can_transition_to(Captured));
        assert!(Authorized.can_transition_to(Voided));
        assert!(Captured.can_transition_to(Refunded));
        assert!(!Authorized.can_transition_to(Refunded));
        assert!(!Declined.can_transition_to(Authorized));
        assert!(!Voided.can_transition_to(Captured));
        assert!(!Refunded.can_transition_to(Captured));
        assert!(!Captured.can_transition_to(Authorized));
    }

    #[test]
    fn capture_requires_authorized_authorization() {
        let auth = txn(TransactionType::Authorization, TransactionStatus::Authorized);
        assert!(TransactionType::Capture.check_parent(&auth).is_ok());

        let pending = txn(TransactionType::Authorization, TransactionStatus::Pending);
        assert!(matches!(
            TransactionType::Capture.check_parent(&pending),
            Err(PaymentError::StateConflict(_))
        ));

        let sale = txn(TransactionType::Sale, TransactionStatus::Captured);
        assert!(TransactionType::Capture.check_parent(&sale).is_err());
    }

    #[test]
    fn refund_requires_captured_leg() {
        let sale = txn(TransactionType::Sale, TransactionStatus::Captured);
        assert!(TransactionType::Refund.check_parent(&sale).is_ok());

        let auth = txn(TransactionType::Authorization, TransactionStatus::Authorized);
        assert!(TransactionType::Refund.check_parent(&auth).is_err());

        let voided = txn(TransactionType::Capture, TransactionStatus::Voided);
        assert!(TransactionType::Refund.check_parent(&voided).is_err());
    }

    #[test]
    fn void_accepts_authorized_or_captured() {
        let auth = txn(TransactionType::Authorization, TransactionStatus::Authorized);
        let sale = txn(TransactionType::Sale, TransactionStatus::Captured);
        let declined = txn(TransactionType::Sale, TransactionStatus::Declined);
        assert!(TransactionType::Void.check_parent(&auth).is_ok());
        assert!(TransactionType::Void.check_parent(&sale).is_ok());
        assert!(TransactionType::Void.check_parent(&declined).is_err());
    }

    #[test]
    fn root_types_reject_parents() {
        let auth = txn(TransactionType::Authorization, TransactionStatus::Authorized);
        assert!(matches!(
            TransactionType::Sale.check_parent(&auth),
            Err(PaymentError::Validation(_))
        ));
    }

    #[test]
    fn fingerprint_mismatch_is_a_conflict() {
        let auth = txn(TransactionType::Authorization, TransactionStatus::Authorized);
        assert!(auth
            .check_fingerprint(&RequestFingerprint::builder("test").finish())
            .is_ok());
        assert!(matches!(
            auth.check_fingerprint(&RequestFingerprint::builder("other").finish()),
            Err(PaymentError::IdempotencyConflict { key }) if key == "k"
        ));
    }

    #[test]
    fn metadata_bounds() {
        let mut metadata = Metadata::new();
        metadata.insert("order".into(), "1234".into());
        assert!(validate_metadata(&metadata).is_ok());

        metadata.insert("x".repeat(MAX_METADATA_KEY_LEN + 1), "v".into());
        assert!(validate_metadata(&metadata).is_err());

        let too_many: Metadata = (0..=MAX_METADATA_ENTRIES)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        assert!(validate_metadata(&too_many).is_err());
    }

    #[test]
    fn payment_method_ref_serializes_tagged() {
        let reference = PaymentMethodRef::one_time(GatewayToken::Financial("bric".into()));
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["type"], "one_time");
        assert_eq!(json["token"]["kind"], "financial");
        assert_eq!(json["token"]["value"], "bric");
    }
}
