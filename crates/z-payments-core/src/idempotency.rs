//! Idempotency keys and ledger records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PaymentError, Result};
use crate::ids::{MerchantId, PaymentMethodId, SubscriptionId, TransactionId};

/// Maximum length of a caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// A caller-supplied opaque key scoping at-most-once execution per merchant.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and wrap a key.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Validation` for empty, oversized or
    /// control-character keys.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(PaymentError::Validation(format!(
                "idempotency key must be 1-{MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(PaymentError::Validation(
                "idempotency key must not contain control characters".into(),
            ));
        }
        Ok(Self(key))
    }

    /// Return the key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of the parts of a request that must match on replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Start a fingerprint for an operation name.
    #[must_use]
    pub fn builder(operation: &str) -> FingerprintBuilder {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        FingerprintBuilder { hasher }
    }

    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Incremental builder for a `RequestFingerprint`.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    /// Mix in a named field. `None` and absent fields hash identically.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.hasher.update([0x1f]);
        self.hasher.update(name.as_bytes());
        self.hasher.update([0x1e]);
        self.hasher.update(value.to_string().as_bytes());
        self
    }

    /// Mix in an optional field.
    #[must_use]
    pub fn opt_field<T: fmt::Display>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self,
        }
    }

    /// Finish the digest.
    #[must_use]
    pub fn finish(self) -> RequestFingerprint {
        RequestFingerprint(hex::encode(self.hasher.finalize()))
    }
}

/// The result an idempotent call resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LedgerResult {
    /// A transaction.
    Transaction(TransactionId),
    /// A subscription.
    Subscription(SubscriptionId),
    /// A saved payment method.
    PaymentMethod(PaymentMethodId),
}

/// Ledger state of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyState {
    /// A caller holds the key; the lease bounds how long.
    Reserved {
        /// When the reservation lapses if no result is stored.
        lease_expires_at: DateTime<Utc>,
    },
    /// The call finished; replays get `result` until `expires_at`.
    Finalized {
        /// Stored result.
        result: LedgerResult,
        /// End of result retention.
        expires_at: DateTime<Utc>,
    },
}

/// One `(merchant, key)` entry of the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Owning merchant.
    pub merchant_id: MerchantId,
    /// The key.
    pub key: IdempotencyKey,
    /// Fingerprint of the request that first used the key.
    pub fingerprint: RequestFingerprint,
    /// Reservation or stored result.
    pub state: IdempotencyState,
    /// When the key was first reserved.
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh reservation.
    #[must_use]
    pub fn reserve(
        merchant_id: MerchantId,
        key: IdempotencyKey,
        fingerprint: RequestFingerprint,
        lease_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            merchant_id,
            key,
            fingerprint,
            state: IdempotencyState::Reserved { lease_expires_at },
            created_at: Utc::now(),
        }
    }

    /// Whether the record still blocks or answers a new attempt at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            IdempotencyState::Reserved { lease_expires_at } => *lease_expires_at > now,
            IdempotencyState::Finalized { expires_at, .. } => *expires_at > now,
        }
    }
}

/// Result of an idempotent operation, flagging replays of a stored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processed<T> {
    /// The value.
    pub value: T,
    /// `true` when the result was produced by an earlier call with the same key.
    pub replayed: bool,
}

impl<T> Processed<T> {
    /// A freshly produced result.
    pub const fn fresh(value: T) -> Self {
        Self {
            value,
            replayed: false,
        }
    }

    /// A replayed result.
    pub const fn replayed(value: T) -> Self {
        Self {
            value,
            replayed: true,
        }
    }

    /// Transform the value, keeping the replay flag.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Processed<U> {
        Processed {
            value: f(self.value),
            replayed: self.replayed,
        }
    }
}
