//! Storage layer for z-payments.
//!
//! The engine treats persistence as a collaborator exposing simple
//! create/read/update-with-guard primitives. Every status mutation is a
//! compare-and-transition against the current status, so a retry racing a
//! duplicate gateway callback cannot lose an update.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: a single-lock in-memory store, the default backend.
//! - `RocksStore` (feature `rocksdb-backend`): `RocksDB` with one column
//!   family per record kind plus prefix indexes.
//!
//! # Example
//!
//! ```no_run
//! use z_payments_store::{MemoryStore, Store};
//! use z_payments_core::TransactionId;
//!
//! let store = MemoryStore::new();
//! let missing = store.get_transaction(&TransactionId::generate()).unwrap();
//! assert!(missing.is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, NaiveDate, Utc};

use z_payments_core::{
    AchVerification, CustomerId, GatewayResult, IdempotencyKey, IdempotencyRecord, LedgerResult,
    MerchantId, PaymentMethod, PaymentMethodId, PaymentMethodRef, Subscription, SubscriptionId,
    Transaction, TransactionFilter, TransactionId, TransactionNumber, TransactionStatus,
    TransactionType, VerificationStatus,
};

/// Outcome of trying to reserve an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The candidate record was stored; the caller owns the key.
    Acquired,
    /// A live record already exists for the key.
    Existing(IdempotencyRecord),
}

/// Fields written together with a guarded status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionUpdate {
    /// New status.
    pub status: TransactionStatus,
    /// Gateway fields to merge onto the record.
    pub gateway: GatewayResult,
    /// Funding instrument resolved by the transition (browser callbacks).
    pub payment_method: Option<PaymentMethodRef>,
}

impl TransactionUpdate {
    /// A bare status change.
    #[must_use]
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status,
            gateway: GatewayResult::default(),
            payment_method: None,
        }
    }

    /// A status change carrying gateway fields.
    #[must_use]
    pub fn with_gateway(status: TransactionStatus, gateway: GatewayResult) -> Self {
        Self {
            status,
            gateway,
            payment_method: None,
        }
    }

    /// Apply this update to a record already checked against the guard.
    pub fn apply_to(&self, txn: &mut Transaction) {
        txn.status = self.status;
        txn.apply_gateway_result(&self.gateway);
        if self.payment_method.is_some() {
            txn.payment_method.clone_from(&self.payment_method);
        }
        txn.updated_at = Utc::now();
    }
}

/// Check a transition guard against the stored record.
///
/// # Errors
///
/// Returns `StoreError::StatusConflict` when the record is not in one of the
/// `expected` statuses or the edge is not part of the state machine. Keeping
/// the current status is allowed, so gateway fields can be recorded on a
/// transaction that stays where it is (an accepted pre-note stays `Pending`).
pub fn check_transition(
    txn: &Transaction,
    expected: &[TransactionStatus],
    next: TransactionStatus,
) -> Result<()> {
    if expected.contains(&txn.status)
        && (txn.status == next || txn.status.can_transition_to(next))
    {
        Ok(())
    } else {
        Err(StoreError::StatusConflict {
            current: txn.status,
            requested: next,
        })
    }
}

/// Candidate transaction numbers tried per key before giving up.
pub const MAX_NUMBER_ATTEMPTS: u32 = 16;

/// Give `txn` the first candidate number for its key that `is_taken` rejects.
///
/// Attempt 0 keeps the number the record already carries. Callers hold their
/// write lock across the check and the insert.
///
/// # Errors
///
/// Returns `StoreError::DuplicateKey` if every candidate is taken.
pub fn assign_transaction_number(
    txn: &mut Transaction,
    mut is_taken: impl FnMut(&TransactionNumber) -> Result<bool>,
) -> Result<()> {
    let mut attempt = 0;
    while is_taken(&txn.transaction_number)? {
        attempt += 1;
        if attempt >= MAX_NUMBER_ATTEMPTS {
            return Err(StoreError::DuplicateKey {
                index: "transaction_number",
                value: txn.transaction_number.to_string(),
            });
        }
        let next =
            TransactionNumber::derive_attempt(&txn.merchant_id, &txn.idempotency_key, attempt);
        tracing::warn!(
            transaction_id = %txn.id,
            taken = %txn.transaction_number,
            next = %next,
            "Transaction number already in use, re-deriving"
        );
        txn.transaction_number = next;
    }
    Ok(())
}

/// Check that `child` may join `parent`'s chain next to `siblings`.
///
/// A void excludes every other live child and vice versa; captures and
/// refunds share the parent's amount with their own type only. Declined
/// and failed children hold nothing.
///
/// # Errors
///
/// - `StoreError::ChainConflict` for an illegal parent or a live void.
/// - `StoreError::LimitExceeded` if the amount does not fit.
pub fn check_child_admission(
    parent: &Transaction,
    siblings: &[Transaction],
    child: &Transaction,
    limit: i64,
) -> Result<()> {
    child
        .transaction_type
        .check_parent(parent)
        .map_err(|e| StoreError::ChainConflict(e.to_string()))?;

    let mut live = siblings
        .iter()
        .filter(|s| s.id != child.id)
        .filter(|s| s.status.counts_against_limit());

    if child.transaction_type == TransactionType::Void {
        if let Some(blocking) = live.next() {
            return Err(StoreError::ChainConflict(format!(
                "{:?} {} is {:?}",
                blocking.transaction_type, blocking.id, blocking.status
            )));
        }
        return Ok(());
    }

    let mut committed = 0;
    for sibling in live {
        if sibling.transaction_type == TransactionType::Void {
            return Err(StoreError::ChainConflict(format!(
                "void {} is {:?}",
                sibling.id, sibling.status
            )));
        }
        if sibling.transaction_type == child.transaction_type {
            committed += sibling.amount_minor;
        }
    }
    if child.transaction_type.is_amount_bounded() && committed + child.amount_minor > limit {
        return Err(StoreError::LimitExceeded {
            limit,
            committed,
            requested: child.amount_minor,
        });
    }
    Ok(())
}

/// The storage trait defining all persistence primitives.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations (in-memory, `RocksDB`).
pub trait Store: Send + Sync {
    // =========================================================================
    // Transaction Operations
    // =========================================================================

    /// Insert a root transaction.
    ///
    /// A transaction number already used by another key of the merchant is
    /// replaced through [`assign_transaction_number`]; `txn` carries the
    /// number actually stored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if the merchant already used the
    /// idempotency key or no free transaction number was found.
    fn insert_transaction(&self, txn: &mut Transaction) -> Result<()>;

    /// Insert a child transaction, atomically applying
    /// [`check_child_admission`] against the parent and its current children.
    ///
    /// # Errors
    ///
    /// - `StoreError::ChainConflict` or `StoreError::LimitExceeded` if the
    ///   child may not join the chain.
    /// - `StoreError::DuplicateKey` as for `insert_transaction`.
    fn insert_child_transaction(&self, txn: &mut Transaction, limit: i64) -> Result<()>;

    /// Save a tokenized bank account together with its pre-note transaction
    /// and pending verification, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` as for `insert_transaction`, or if
    /// the method already has a verification.
    fn insert_ach_account(
        &self,
        method: &PaymentMethod,
        prenote: &mut Transaction,
        verification: &AchVerification,
    ) -> Result<()>;

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>>;

    /// Find the transaction a merchant created under an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_transaction_by_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Transaction>>;

    /// Find a merchant's transaction by gateway transaction number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_transaction_by_number(
        &self,
        merchant_id: &MerchantId,
        number: &TransactionNumber,
    ) -> Result<Option<Transaction>>;

    /// List direct children of a transaction, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_children(&self, parent_id: &TransactionId) -> Result<Vec<Transaction>>;

    /// List a merchant's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions(
        &self,
        merchant_id: &MerchantId,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>>;

    /// List `Pending`/`Ambiguous` transactions last touched before `before`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_unresolved_transactions(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// Guarded compare-and-transition.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the transaction doesn't exist.
    /// - `StoreError::StatusConflict` if the current status is not in
    ///   `expected` or the edge is illegal.
    fn transition_transaction(
        &self,
        id: &TransactionId,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<Transaction>;

    /// Delete a transaction that is still `Pending`, releasing its indexes.
    ///
    /// Used when the gateway was never reached, so no side effect remains.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the transaction doesn't exist.
    /// - `StoreError::StatusConflict` if it is no longer `Pending`.
    fn delete_pending_transaction(&self, id: &TransactionId) -> Result<()>;

    // =========================================================================
    // Payment Method Operations
    // =========================================================================

    /// Insert or replace a payment method.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_payment_method(&self, method: &PaymentMethod) -> Result<()>;

    /// Get a payment method by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment_method(&self, id: &PaymentMethodId) -> Result<Option<PaymentMethod>>;

    /// List a customer's payment methods, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_payment_methods(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<PaymentMethod>>;

    // =========================================================================
    // ACH Verification Operations
    // =========================================================================

    /// Get the verification of a payment method.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ach_verification(
        &self,
        payment_method_id: &PaymentMethodId,
    ) -> Result<Option<AchVerification>>;

    /// List `Pending` verifications created before `before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_ach_verifications(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchVerification>>;

    /// Resolve a pending verification and update its payment method in one
    /// step: `Verified` marks the method verified, `Failed` deactivates it.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the verification or method doesn't exist.
    /// - `StoreError::VerificationConflict` if it is no longer `Pending`.
    fn resolve_ach_verification(
        &self,
        payment_method_id: &PaymentMethodId,
        status: VerificationStatus,
        return_code: Option<&str>,
    ) -> Result<AchVerification>;

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    /// Insert a subscription.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if the ID exists.
    fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Get a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>>;

    /// Replace a subscription if the stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the subscription doesn't exist.
    /// - `StoreError::VersionConflict` if another writer got there first.
    fn update_subscription(&self, subscription: &Subscription, expected_version: u64)
        -> Result<()>;

    /// List a customer's subscriptions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_customer_subscriptions(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Subscription>>;

    /// List `Active` subscriptions due on or before `as_of`, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_due_subscriptions(&self, as_of: NaiveDate, limit: usize) -> Result<Vec<Subscription>>;

    // =========================================================================
    // Idempotency Ledger Operations
    // =========================================================================

    /// Store `candidate` unless a live record exists for its key.
    ///
    /// A record is live while its reservation lease or result retention has
    /// not expired at `now`; expired records are replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn reserve_idempotency_key(
        &self,
        candidate: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Get the ledger record of a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_idempotency_record(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Store the final result of a key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the key was never reserved.
    fn finalize_idempotency_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        result: LedgerResult,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop a reservation so the key can be retried immediately.
    ///
    /// Finalized records are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn release_idempotency_key(&self, merchant_id: &MerchantId, key: &IdempotencyKey)
        -> Result<()>;

    /// Remove ledger records that are no longer live. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn purge_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize>;
}
