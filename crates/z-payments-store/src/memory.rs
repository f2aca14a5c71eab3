//! In-memory storage implementation.
//!
//! All tables sit behind one `RwLock`, which makes every compound operation
//! (guarded transitions, child inserts with limit checks, key reservations)
//! atomic with respect to every other.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};

use z_payments_core::{
    AchVerification, CustomerId, IdempotencyKey, IdempotencyRecord, IdempotencyState,
    LedgerResult, MerchantId, PaymentMethod, PaymentMethodId, Subscription, SubscriptionId,
    SubscriptionStatus, Transaction, TransactionFilter, TransactionId, TransactionNumber,
    TransactionStatus, VerificationStatus,
};

use crate::error::{Result, StoreError};
use crate::{
    assign_transaction_number, check_child_admission, check_transition, Reservation, Store,
    TransactionUpdate,
};

type LedgerKey = (MerchantId, String);

#[derive(Default)]
struct Tables {
    transactions: HashMap<TransactionId, Transaction>,
    transactions_by_key: HashMap<LedgerKey, TransactionId>,
    transactions_by_number: HashMap<(MerchantId, TransactionNumber), TransactionId>,
    children: HashMap<TransactionId, BTreeSet<TransactionId>>,
    payment_methods: HashMap<PaymentMethodId, PaymentMethod>,
    ach_verifications: HashMap<PaymentMethodId, AchVerification>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    idempotency: HashMap<LedgerKey, IdempotencyRecord>,
}

impl Tables {
    fn check_unique(&self, txn: &mut Transaction) -> Result<()> {
        let key = (txn.merchant_id, txn.idempotency_key.clone());
        if self.transactions_by_key.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                index: "idempotency_key",
                value: txn.idempotency_key.clone(),
            });
        }
        if self.transactions.contains_key(&txn.id) {
            return Err(StoreError::DuplicateKey {
                index: "transaction_id",
                value: txn.id.to_string(),
            });
        }
        let merchant_id = txn.merchant_id;
        assign_transaction_number(txn, |number| {
            Ok(self
                .transactions_by_number
                .contains_key(&(merchant_id, number.clone())))
        })
    }

    fn check_verification_unique(&self, verification: &AchVerification) -> Result<()> {
        if self
            .ach_verifications
            .contains_key(&verification.payment_method_id)
        {
            return Err(StoreError::DuplicateKey {
                index: "ach_verification",
                value: verification.payment_method_id.to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, txn: &Transaction) {
        self.transactions_by_key
            .insert((txn.merchant_id, txn.idempotency_key.clone()), txn.id);
        self.transactions_by_number
            .insert((txn.merchant_id, txn.transaction_number.clone()), txn.id);
        if let Some(parent) = txn.parent_transaction_id {
            self.children.entry(parent).or_default().insert(txn.id);
        }
        self.transactions.insert(txn.id, txn.clone());
    }

    fn children_of(&self, parent_id: &TransactionId) -> Vec<Transaction> {
        self.children
            .get(parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transactions.get(id).cloned())
            .collect()
    }
}

/// In-memory `Store` implementation.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    // =========================================================================
    // Transaction Operations
    // =========================================================================

    fn insert_transaction(&self, txn: &mut Transaction) -> Result<()> {
        let mut tables = self.write()?;
        tables.check_unique(txn)?;
        tables.insert(txn);
        Ok(())
    }

    fn insert_child_transaction(&self, txn: &mut Transaction, limit: i64) -> Result<()> {
        let parent_id = txn
            .parent_transaction_id
            .ok_or_else(|| StoreError::Database("child transaction without parent".into()))?;

        let mut tables = self.write()?;
        let parent = tables
            .transactions
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transaction", parent_id))?;
        tables.check_unique(txn)?;
        check_child_admission(&parent, &tables.children_of(&parent_id), txn, limit)?;

        tables.insert(txn);
        Ok(())
    }

    fn insert_ach_account(
        &self,
        method: &PaymentMethod,
        prenote: &mut Transaction,
        verification: &AchVerification,
    ) -> Result<()> {
        let mut tables = self.write()?;
        tables.check_unique(prenote)?;
        tables.check_verification_unique(verification)?;

        tables.payment_methods.insert(method.id, method.clone());
        tables.insert(prenote);
        tables
            .ach_verifications
            .insert(verification.payment_method_id, verification.clone());
        Ok(())
    }

    fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        Ok(self.read()?.transactions.get(id).cloned())
    }

    fn find_transaction_by_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Transaction>> {
        let tables = self.read()?;
        Ok(tables
            .transactions_by_key
            .get(&(*merchant_id, key.as_str().to_string()))
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    fn find_transaction_by_number(
        &self,
        merchant_id: &MerchantId,
        number: &TransactionNumber,
    ) -> Result<Option<Transaction>> {
        let tables = self.read()?;
        Ok(tables
            .transactions_by_number
            .get(&(*merchant_id, number.clone()))
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    fn list_children(&self, parent_id: &TransactionId) -> Result<Vec<Transaction>> {
        Ok(self.read()?.children_of(parent_id))
    }

    fn list_transactions(
        &self,
        merchant_id: &MerchantId,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let tables = self.read()?;
        let mut matching: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.merchant_id == *merchant_id && filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    fn list_unresolved_transactions(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let tables = self.read()?;
        let mut unresolved: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.status.is_unresolved() && t.updated_at < before)
            .cloned()
            .collect();
        unresolved.sort_by_key(|t| t.id);
        unresolved.truncate(limit);
        Ok(unresolved)
    }

    fn transition_transaction(
        &self,
        id: &TransactionId,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<Transaction> {
        let mut tables = self.write()?;
        let txn = tables
            .transactions
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("transaction", id))?;

        check_transition(txn, expected, update.status)?;
        update.apply_to(txn);
        Ok(txn.clone())
    }

    fn delete_pending_transaction(&self, id: &TransactionId) -> Result<()> {
        let mut tables = self.write()?;
        let txn = tables
            .transactions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("transaction", id))?;

        if txn.status != TransactionStatus::Pending {
            return Err(StoreError::StatusConflict {
                current: txn.status,
                requested: TransactionStatus::Failed,
            });
        }

        tables.transactions.remove(id);
        tables
            .transactions_by_key
            .remove(&(txn.merchant_id, txn.idempotency_key.clone()));
        tables
            .transactions_by_number
            .remove(&(txn.merchant_id, txn.transaction_number.clone()));
        if let Some(parent) = txn.parent_transaction_id {
            if let Some(children) = tables.children.get_mut(&parent) {
                children.remove(id);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Payment Method Operations
    // =========================================================================

    fn put_payment_method(&self, method: &PaymentMethod) -> Result<()> {
        self.write()?.payment_methods.insert(method.id, method.clone());
        Ok(())
    }

    fn get_payment_method(&self, id: &PaymentMethodId) -> Result<Option<PaymentMethod>> {
        Ok(self.read()?.payment_methods.get(id).cloned())
    }

    fn list_payment_methods(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<PaymentMethod>> {
        let tables = self.read()?;
        let mut methods: Vec<PaymentMethod> = tables
            .payment_methods
            .values()
            .filter(|m| m.merchant_id == *merchant_id && m.customer_id == *customer_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_at);
        Ok(methods)
    }

    // =========================================================================
    // ACH Verification Operations
    // =========================================================================

    fn get_ach_verification(
        &self,
        payment_method_id: &PaymentMethodId,
    ) -> Result<Option<AchVerification>> {
        Ok(self.read()?.ach_verifications.get(payment_method_id).cloned())
    }

    fn list_pending_ach_verifications(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchVerification>> {
        let tables = self.read()?;
        let mut pending: Vec<AchVerification> = tables
            .ach_verifications
            .values()
            .filter(|v| v.status == VerificationStatus::Pending && v.created_at < before)
            .cloned()
            .collect();
        pending.sort_by_key(|v| v.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    fn resolve_ach_verification(
        &self,
        payment_method_id: &PaymentMethodId,
        status: VerificationStatus,
        return_code: Option<&str>,
    ) -> Result<AchVerification> {
        let mut tables = self.write()?;
        let current = tables
            .ach_verifications
            .get(payment_method_id)
            .ok_or_else(|| StoreError::not_found("ach_verification", payment_method_id))?;
        if current.status != VerificationStatus::Pending {
            return Err(StoreError::VerificationConflict {
                current: current.status,
            });
        }
        if !tables.payment_methods.contains_key(payment_method_id) {
            return Err(StoreError::not_found("payment_method", payment_method_id));
        }

        let now = Utc::now();
        if let Some(method) = tables.payment_methods.get_mut(payment_method_id) {
            match status {
                VerificationStatus::Verified => method.is_verified = true,
                VerificationStatus::Failed => {
                    method.is_verified = false;
                    method.is_active = false;
                }
                VerificationStatus::Pending => {}
            }
            method.updated_at = now;
        }

        let verification = tables
            .ach_verifications
            .get_mut(payment_method_id)
            .ok_or_else(|| StoreError::not_found("ach_verification", payment_method_id))?;
        verification.status = status;
        verification.return_code = return_code.map(str::to_string);
        verification.updated_at = now;
        Ok(verification.clone())
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut tables = self.write()?;
        if tables.subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::DuplicateKey {
                index: "subscription_id",
                value: subscription.id.to_string(),
            });
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.read()?.subscriptions.get(id).cloned())
    }

    fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let stored = tables
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or_else(|| StoreError::not_found("subscription", subscription.id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }
        *stored = subscription.clone();
        Ok(())
    }

    fn list_customer_subscriptions(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Subscription>> {
        let tables = self.read()?;
        let mut subscriptions: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.merchant_id == *merchant_id && s.customer_id == *customer_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.id);
        Ok(subscriptions)
    }

    fn list_due_subscriptions(&self, as_of: NaiveDate, limit: usize) -> Result<Vec<Subscription>> {
        let tables = self.read()?;
        let mut due: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_billing_date <= as_of)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_billing_date, s.id));
        due.truncate(limit);
        Ok(due)
    }

    // =========================================================================
    // Idempotency Ledger Operations
    // =========================================================================

    fn reserve_idempotency_key(
        &self,
        candidate: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut tables = self.write()?;
        let key = (candidate.merchant_id, candidate.key.as_str().to_string());

        if let Some(existing) = tables.idempotency.get(&key) {
            if existing.is_live(now) {
                return Ok(Reservation::Existing(existing.clone()));
            }
        }

        tables.idempotency.insert(key, candidate.clone());
        Ok(Reservation::Acquired)
    }

    fn get_idempotency_record(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .read()?
            .idempotency
            .get(&(*merchant_id, key.as_str().to_string()))
            .cloned())
    }

    fn finalize_idempotency_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        result: LedgerResult,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let record = tables
            .idempotency
            .get_mut(&(*merchant_id, key.as_str().to_string()))
            .ok_or_else(|| StoreError::not_found("idempotency_key", key))?;
        record.state = IdempotencyState::Finalized { result, expires_at };
        Ok(())
    }

    fn release_idempotency_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let ledger_key = (*merchant_id, key.as_str().to_string());
        if matches!(
            tables.idempotency.get(&ledger_key).map(|r| &r.state),
            Some(IdempotencyState::Reserved { .. })
        ) {
            tables.idempotency.remove(&ledger_key);
        }
        Ok(())
    }

    fn purge_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.write()?;
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, record| record.is_live(now));
        Ok(before - tables.idempotency.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use z_payments_core::{
        Currency, GatewayResult, Metadata, PaymentMethodType, RequestFingerprint, TransactionType,
    };

    fn transaction(
        merchant_id: MerchantId,
        key: &str,
        transaction_type: TransactionType,
        amount_minor: i64,
        status: TransactionStatus,
        parent: Option<TransactionId>,
    ) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TransactionId::generate(),
            merchant_id,
            customer_id: None,
            amount_minor,
            currency: Currency::usd(),
            status,
            transaction_type,
            payment_method_type: PaymentMethodType::CreditCard,
            payment_method: None,
            transaction_number: TransactionNumber::derive(&merchant_id, key),
            gateway_transaction_id: None,
            gateway_response_code: None,
            gateway_response_message: None,
            gateway_auth_code: None,
            idempotency_key: key.to_string(),
            request_fingerprint: RequestFingerprint::builder(key).finish(),
            parent_transaction_id: parent,
            browser: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn duplicate_idempotency_key_rejected() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut first = transaction(
            merchant,
            "k1",
            TransactionType::Sale,
            100,
            TransactionStatus::Pending,
            None,
        );
        store.insert_transaction(&mut first).unwrap();

        let mut second = first.clone();
        second.id = TransactionId::generate();
        assert!(matches!(
            store.insert_transaction(&mut second),
            Err(StoreError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn child_insert_enforces_limit() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut auth = transaction(
            merchant,
            "auth",
            TransactionType::Authorization,
            1000,
            TransactionStatus::Authorized,
            None,
        );
        store.insert_transaction(&mut auth).unwrap();

        let mut cap1 = transaction(
            merchant,
            "cap1",
            TransactionType::Capture,
            600,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        store.insert_child_transaction(&mut cap1, 1000).unwrap();

        let mut cap2 = transaction(
            merchant,
            "cap2",
            TransactionType::Capture,
            500,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        assert!(matches!(
            store.insert_child_transaction(&mut cap2, 1000),
            Err(StoreError::LimitExceeded {
                limit: 1000,
                committed: 600,
                requested: 500
            })
        ));

        // A declined sibling frees its reservation.
        store
            .transition_transaction(
                &cap1.id,
                &[TransactionStatus::Pending],
                &TransactionUpdate::status(TransactionStatus::Declined),
            )
            .unwrap();
        store.insert_child_transaction(&mut cap2, 1000).unwrap();
        assert_eq!(store.list_children(&auth.id).unwrap().len(), 2);
    }

    #[test]
    fn live_void_and_amount_children_exclude_each_other() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut auth = transaction(
            merchant,
            "auth",
            TransactionType::Authorization,
            1000,
            TransactionStatus::Authorized,
            None,
        );
        store.insert_transaction(&mut auth).unwrap();

        let mut void = transaction(
            merchant,
            "void",
            TransactionType::Void,
            1000,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        store.insert_child_transaction(&mut void, 1000).unwrap();
        store
            .transition_transaction(
                &void.id,
                &[TransactionStatus::Pending],
                &TransactionUpdate::status(TransactionStatus::Ambiguous),
            )
            .unwrap();

        let mut capture = transaction(
            merchant,
            "cap",
            TransactionType::Capture,
            1000,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        assert!(matches!(
            store.insert_child_transaction(&mut capture, 1000),
            Err(StoreError::ChainConflict(_))
        ));

        // Once the void is known to have failed, the capture may proceed and
        // in turn blocks a second void.
        store
            .transition_transaction(
                &void.id,
                &[TransactionStatus::Ambiguous],
                &TransactionUpdate::status(TransactionStatus::Failed),
            )
            .unwrap();
        store.insert_child_transaction(&mut capture, 1000).unwrap();

        let mut second_void = transaction(
            merchant,
            "void2",
            TransactionType::Void,
            1000,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        assert!(matches!(
            store.insert_child_transaction(&mut second_void, 1000),
            Err(StoreError::ChainConflict(_))
        ));
    }

    #[test]
    fn child_insert_rechecks_parent_status() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut auth = transaction(
            merchant,
            "auth",
            TransactionType::Authorization,
            1000,
            TransactionStatus::Voided,
            None,
        );
        store.insert_transaction(&mut auth).unwrap();

        let mut capture = transaction(
            merchant,
            "cap",
            TransactionType::Capture,
            500,
            TransactionStatus::Pending,
            Some(auth.id),
        );
        assert!(matches!(
            store.insert_child_transaction(&mut capture, 1000),
            Err(StoreError::ChainConflict(_))
        ));
        assert!(store.list_children(&auth.id).unwrap().is_empty());
    }

    #[test]
    fn taken_transaction_number_is_re_derived() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut first = transaction(
            merchant,
            "first",
            TransactionType::Sale,
            100,
            TransactionStatus::Pending,
            None,
        );
        store.insert_transaction(&mut first).unwrap();

        let mut colliding = transaction(
            merchant,
            "second",
            TransactionType::Sale,
            100,
            TransactionStatus::Pending,
            None,
        );
        colliding.transaction_number = first.transaction_number.clone();
        store.insert_transaction(&mut colliding).unwrap();

        let expected = TransactionNumber::derive_attempt(&merchant, "second", 1);
        assert_eq!(colliding.transaction_number, expected);
        let found = store
            .find_transaction_by_number(&merchant, &expected)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, colliding.id);
        let original = store
            .find_transaction_by_number(&merchant, &first.transaction_number)
            .unwrap()
            .unwrap();
        assert_eq!(original.id, first.id);
    }

    #[test]
    fn ach_account_insert_is_all_or_nothing() {
        use z_payments_core::{AchAccountType, PaymentMethodRef};

        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let now = Utc::now();
        let method = PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: merchant,
            customer_id: CustomerId::generate(),
            method_type: PaymentMethodType::Ach,
            storage_token: "stor-1".into(),
            last_four: "6789".into(),
            card_brand: None,
            ach_account_type: Some(AchAccountType::Checking),
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
        };
        let mut prenote = transaction(
            merchant,
            "acct#prenote",
            TransactionType::Verification,
            0,
            TransactionStatus::Pending,
            None,
        );
        prenote.payment_method = Some(PaymentMethodRef::saved(method.id));
        let verification = AchVerification::pending(method.id, merchant, prenote.id);

        store
            .insert_ach_account(&method, &mut prenote, &verification)
            .unwrap();
        assert!(store.get_payment_method(&method.id).unwrap().is_some());
        assert!(store.get_ach_verification(&method.id).unwrap().is_some());

        // A second account reusing the pre-note key leaves nothing behind.
        let other = PaymentMethod {
            id: PaymentMethodId::generate(),
            ..method.clone()
        };
        let mut duplicate = prenote.clone();
        duplicate.id = TransactionId::generate();
        let duplicate_verification = AchVerification::pending(other.id, merchant, duplicate.id);
        assert!(matches!(
            store.insert_ach_account(&other, &mut duplicate, &duplicate_verification),
            Err(StoreError::DuplicateKey { .. })
        ));
        assert!(store.get_payment_method(&other.id).unwrap().is_none());
        assert!(store.get_ach_verification(&other.id).unwrap().is_none());
    }

    #[test]
    fn guarded_transition_rejects_stale_status() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut txn = transaction(
            merchant,
            "k",
            TransactionType::Sale,
            100,
            TransactionStatus::Pending,
            None,
        );
        store.insert_transaction(&mut txn).unwrap();

        let update = TransactionUpdate::with_gateway(
            TransactionStatus::Captured,
            GatewayResult {
                gateway_transaction_id: Some("guid".into()),
                ..GatewayResult::default()
            },
        );
        let updated = store
            .transition_transaction(&txn.id, &[TransactionStatus::Pending], &update)
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Captured);
        assert_eq!(updated.gateway_transaction_id.as_deref(), Some("guid"));

        assert!(matches!(
            store.transition_transaction(&txn.id, &[TransactionStatus::Pending], &update),
            Err(StoreError::StatusConflict { .. })
        ));
    }

    #[test]
    fn delete_pending_releases_indexes() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let mut txn = transaction(
            merchant,
            "k",
            TransactionType::Sale,
            100,
            TransactionStatus::Pending,
            None,
        );
        store.insert_transaction(&mut txn).unwrap();
        store.delete_pending_transaction(&txn.id).unwrap();

        let key = IdempotencyKey::new("k").unwrap();
        assert!(store.find_transaction_by_key(&merchant, &key).unwrap().is_none());
        store.insert_transaction(&mut txn).unwrap();
    }

    #[test]
    fn reservation_lifecycle() {
        let store = MemoryStore::new();
        let merchant = MerchantId::generate();
        let key = IdempotencyKey::new("k").unwrap();
        let now = Utc::now();
        let record = IdempotencyRecord::reserve(
            merchant,
            key.clone(),
            RequestFingerprint::builder("op").finish(),
            now + Duration::seconds(30),
        );

        assert_eq!(
            store.reserve_idempotency_key(&record, now).unwrap(),
            Reservation::Acquired
        );
        assert!(matches!(
            store.reserve_idempotency_key(&record, now).unwrap(),
            Reservation::Existing(_)
        ));

        // After the lease lapses the key can be taken again.
        assert_eq!(
            store
                .reserve_idempotency_key(&record, now + Duration::seconds(31))
                .unwrap(),
            Reservation::Acquired
        );

        let txn_id = TransactionId::generate();
        store
            .finalize_idempotency_key(
                &merchant,
                &key,
                LedgerResult::Transaction(txn_id),
                now + Duration::hours(24),
            )
            .unwrap();
        store.release_idempotency_key(&merchant, &key).unwrap();
        let stored = store.get_idempotency_record(&merchant, &key).unwrap().unwrap();
        assert!(matches!(
            stored.state,
            IdempotencyState::Finalized {
                result: LedgerResult::Transaction(id),
                ..
            } if id == txn_id
        ));

        assert_eq!(
            store
                .purge_idempotency_records(now + Duration::hours(25))
                .unwrap(),
            1
        );
    }
}
