//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Reads go straight to the database; every write that checks a guard first
//! (unique indexes, status transitions, amount limits, version checks) runs
//! under a single write mutex and commits with one `WriteBatch`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use z_payments_core::{
    AchVerification, CustomerId, IdempotencyKey, IdempotencyRecord, IdempotencyState,
    LedgerResult, MerchantId, PaymentMethod, PaymentMethodId, Subscription, SubscriptionId,
    SubscriptionStatus, Transaction, TransactionFilter, TransactionId, TransactionNumber,
    TransactionStatus, VerificationStatus,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{
    assign_transaction_number, check_child_admission, check_transition, Reservation, Store,
    TransactionUpdate,
};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        Ok(self
            .db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Collect the keys of an index column family under `prefix`, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut found = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key.to_vec());
        }
        Ok(found)
    }

    /// Decode every value of a column family.
    fn scan_values<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    /// Resolve a unique index entry to its transaction.
    fn get_indexed_transaction(&self, cf_name: &str, key: &[u8]) -> Result<Option<Transaction>> {
        let cf = self.cf(cf_name)?;
        let Some(id) = self
            .db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let id = TransactionId::from_bytes(keys::trailing_id(&id)?);
        self.get_transaction(&id)
    }

    fn check_unique(&self, txn: &mut Transaction) -> Result<()> {
        if self.exists(
            cf::TRANSACTIONS_BY_KEY,
            &keys::merchant_scoped_key(&txn.merchant_id, &txn.idempotency_key),
        )? {
            return Err(StoreError::DuplicateKey {
                index: "idempotency_key",
                value: txn.idempotency_key.clone(),
            });
        }
        if self.exists(cf::TRANSACTIONS, &keys::transaction_key(&txn.id))? {
            return Err(StoreError::DuplicateKey {
                index: "transaction_id",
                value: txn.id.to_string(),
            });
        }
        let merchant_id = txn.merchant_id;
        assign_transaction_number(txn, |number| {
            self.exists(
                cf::TRANSACTIONS_BY_NUMBER,
                &keys::transaction_number_key(&merchant_id, number),
            )
        })
    }

    /// Add a new transaction with all of its index entries to `batch`.
    fn stage_new_transaction(&self, batch: &mut WriteBatch, txn: &Transaction) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_key = self.cf(cf::TRANSACTIONS_BY_KEY)?;
        let cf_by_number = self.cf(cf::TRANSACTIONS_BY_NUMBER)?;
        let cf_by_merchant = self.cf(cf::TRANSACTIONS_BY_MERCHANT)?;
        let cf_children = self.cf(cf::TRANSACTION_CHILDREN)?;

        let id_bytes = txn.id.to_bytes();
        let value = Self::serialize(txn)?;

        batch.put_cf(&cf_tx, keys::transaction_key(&txn.id), &value);
        batch.put_cf(
            &cf_by_key,
            keys::merchant_scoped_key(&txn.merchant_id, &txn.idempotency_key),
            id_bytes,
        );
        batch.put_cf(
            &cf_by_number,
            keys::transaction_number_key(&txn.merchant_id, &txn.transaction_number),
            id_bytes,
        );
        batch.put_cf(
            &cf_by_merchant,
            keys::merchant_transaction_key(&txn.merchant_id, &txn.id),
            [],
        );
        if let Some(parent) = txn.parent_transaction_id {
            batch.put_cf(&cf_children, keys::child_key(&parent, &txn.id), []);
        }
        Ok(())
    }

    fn stage_payment_method(&self, batch: &mut WriteBatch, method: &PaymentMethod) -> Result<()> {
        let cf_pm = self.cf(cf::PAYMENT_METHODS)?;
        let cf_by_customer = self.cf(cf::PAYMENT_METHODS_BY_CUSTOMER)?;

        batch.put_cf(
            &cf_pm,
            keys::payment_method_key(&method.id),
            Self::serialize(method)?,
        );
        batch.put_cf(
            &cf_by_customer,
            keys::customer_record_key(&method.merchant_id, &method.customer_id, *method.id.as_bytes()),
            [],
        );
        Ok(())
    }

    fn put_transaction_record(&self, txn: &Transaction) -> Result<()> {
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tx, keys::transaction_key(&txn.id), Self::serialize(txn)?);
        self.write(batch)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Transaction Operations
    // =========================================================================

    fn insert_transaction(&self, txn: &mut Transaction) -> Result<()> {
        let _guard = self.lock()?;
        self.check_unique(txn)?;
        let mut batch = WriteBatch::default();
        self.stage_new_transaction(&mut batch, txn)?;
        self.write(batch)
    }

    fn insert_child_transaction(&self, txn: &mut Transaction, limit: i64) -> Result<()> {
        let parent_id = txn
            .parent_transaction_id
            .ok_or_else(|| StoreError::Database("child transaction without parent".into()))?;

        let _guard = self.lock()?;
        let parent = self
            .get_transaction(&parent_id)?
            .ok_or_else(|| StoreError::not_found("transaction", parent_id))?;
        self.check_unique(txn)?;
        check_child_admission(&parent, &self.list_children(&parent_id)?, txn, limit)?;

        let mut batch = WriteBatch::default();
        self.stage_new_transaction(&mut batch, txn)?;
        self.write(batch)
    }

    fn insert_ach_account(
        &self,
        method: &PaymentMethod,
        prenote: &mut Transaction,
        verification: &AchVerification,
    ) -> Result<()> {
        let verification_key = keys::payment_method_key(&verification.payment_method_id);

        let _guard = self.lock()?;
        self.check_unique(prenote)?;
        if self.exists(cf::ACH_VERIFICATIONS, &verification_key)? {
            return Err(StoreError::DuplicateKey {
                index: "ach_verification",
                value: verification.payment_method_id.to_string(),
            });
        }

        let cf_verifications = self.cf(cf::ACH_VERIFICATIONS)?;
        let mut batch = WriteBatch::default();
        self.stage_payment_method(&mut batch, method)?;
        self.stage_new_transaction(&mut batch, prenote)?;
        batch.put_cf(&cf_verifications, verification_key, Self::serialize(verification)?);
        self.write(batch)
    }

    fn get_transaction(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        self.get(cf::TRANSACTIONS, &keys::transaction_key(id))
    }

    fn find_transaction_by_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Transaction>> {
        self.get_indexed_transaction(
            cf::TRANSACTIONS_BY_KEY,
            &keys::merchant_scoped_key(merchant_id, key.as_str()),
        )
    }

    fn find_transaction_by_number(
        &self,
        merchant_id: &MerchantId,
        number: &TransactionNumber,
    ) -> Result<Option<Transaction>> {
        self.get_indexed_transaction(
            cf::TRANSACTIONS_BY_NUMBER,
            &keys::transaction_number_key(merchant_id, number),
        )
    }

    fn list_children(&self, parent_id: &TransactionId) -> Result<Vec<Transaction>> {
        let prefix = keys::transaction_key(parent_id);
        let mut children = Vec::new();
        for key in self.scan_prefix(cf::TRANSACTION_CHILDREN, &prefix)? {
            let child_id = TransactionId::from_bytes(keys::trailing_id(&key)?);
            if let Some(child) = self.get_transaction(&child_id)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    fn list_transactions(
        &self,
        merchant_id: &MerchantId,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let mut all_keys = self.scan_prefix(cf::TRANSACTIONS_BY_MERCHANT, merchant_id.as_bytes())?;

        // ULID order is creation order; reverse for newest first.
        all_keys.reverse();

        let mut transactions = Vec::new();
        let mut skipped = 0;
        for key in all_keys {
            if transactions.len() >= limit {
                break;
            }
            let tx_id = TransactionId::from_bytes(keys::trailing_id(&key)?);
            let Some(tx) = self.get_transaction(&tx_id)? else {
                continue;
            };
            if !filter.matches(&tx) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            transactions.push(tx);
        }

        Ok(transactions)
    }

    fn list_unresolved_transactions(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        // Keys are ULIDs, so the scan is already oldest first.
        let mut unresolved: Vec<Transaction> = self
            .scan_values::<Transaction>(cf::TRANSACTIONS)?
            .into_iter()
            .filter(|t| t.status.is_unresolved() && t.updated_at < before)
            .collect();
        unresolved.truncate(limit);
        Ok(unresolved)
    }

    fn transition_transaction(
        &self,
        id: &TransactionId,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<Transaction> {
        let _guard = self.lock()?;
        let mut txn = self
            .get_transaction(id)?
            .ok_or_else(|| StoreError::not_found("transaction", id))?;

        check_transition(&txn, expected, update.status)?;
        update.apply_to(&mut txn);
        self.put_transaction_record(&txn)?;
        Ok(txn)
    }

    fn delete_pending_transaction(&self, id: &TransactionId) -> Result<()> {
        let _guard = self.lock()?;
        let txn = self
            .get_transaction(id)?
            .ok_or_else(|| StoreError::not_found("transaction", id))?;

        if txn.status != TransactionStatus::Pending {
            return Err(StoreError::StatusConflict {
                current: txn.status,
                requested: TransactionStatus::Failed,
            });
        }

        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_key = self.cf(cf::TRANSACTIONS_BY_KEY)?;
        let cf_by_number = self.cf(cf::TRANSACTIONS_BY_NUMBER)?;
        let cf_by_merchant = self.cf(cf::TRANSACTIONS_BY_MERCHANT)?;
        let cf_children = self.cf(cf::TRANSACTION_CHILDREN)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_tx, keys::transaction_key(id));
        batch.delete_cf(
            &cf_by_key,
            keys::merchant_scoped_key(&txn.merchant_id, &txn.idempotency_key),
        );
        batch.delete_cf(
            &cf_by_number,
            keys::transaction_number_key(&txn.merchant_id, &txn.transaction_number),
        );
        batch.delete_cf(
            &cf_by_merchant,
            keys::merchant_transaction_key(&txn.merchant_id, id),
        );
        if let Some(parent) = txn.parent_transaction_id {
            batch.delete_cf(&cf_children, keys::child_key(&parent, id));
        }
        self.write(batch)
    }

    // =========================================================================
    // Payment Method Operations
    // =========================================================================

    fn put_payment_method(&self, method: &PaymentMethod) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_payment_method(&mut batch, method)?;

        let _guard = self.lock()?;
        self.write(batch)
    }

    fn get_payment_method(&self, id: &PaymentMethodId) -> Result<Option<PaymentMethod>> {
        self.get(cf::PAYMENT_METHODS, &keys::payment_method_key(id))
    }

    fn list_payment_methods(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<PaymentMethod>> {
        let prefix = keys::customer_prefix(merchant_id, customer_id);
        let mut methods = Vec::new();
        for key in self.scan_prefix(cf::PAYMENT_METHODS_BY_CUSTOMER, &prefix)? {
            let id = PaymentMethodId::from_bytes(keys::trailing_id(&key)?);
            if let Some(method) = self.get_payment_method(&id)? {
                methods.push(method);
            }
        }
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
        self.get(
            cf::ACH_VERIFICATIONS,
            &keys::payment_method_key(payment_method_id),
        )
    }

    fn list_pending_ach_verifications(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchVerification>> {
        let mut pending: Vec<AchVerification> = self
            .scan_values::<AchVerification>(cf::ACH_VERIFICATIONS)?
            .into_iter()
            .filter(|v| v.status == VerificationStatus::Pending && v.created_at < before)
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
        let _guard = self.lock()?;
        let mut verification = self
            .get_ach_verification(payment_method_id)?
            .ok_or_else(|| StoreError::not_found("ach_verification", payment_method_id))?;
        if verification.status != VerificationStatus::Pending {
            return Err(StoreError::VerificationConflict {
                current: verification.status,
            });
        }
        let mut method = self
            .get_payment_method(payment_method_id)?
            .ok_or_else(|| StoreError::not_found("payment_method", payment_method_id))?;

        let now = Utc::now();
        match status {
            VerificationStatus::Verified => method.is_verified = true,
            VerificationStatus::Failed => {
                method.is_verified = false;
                method.is_active = false;
            }
            VerificationStatus::Pending => {}
        }
        method.updated_at = now;
        verification.status = status;
        verification.return_code = return_code.map(str::to_string);
        verification.updated_at = now;

        let cf_verifications = self.cf(cf::ACH_VERIFICATIONS)?;
        let cf_pm = self.cf(cf::PAYMENT_METHODS)?;
        let key = keys::payment_method_key(payment_method_id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_verifications, &key, Self::serialize(&verification)?);
        batch.put_cf(&cf_pm, &key, Self::serialize(&method)?);
        self.write(batch)?;

        Ok(verification)
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let key = keys::subscription_key(&subscription.id);
        let _guard = self.lock()?;
        if self.exists(cf::SUBSCRIPTIONS, &key)? {
            return Err(StoreError::DuplicateKey {
                index: "subscription_id",
                value: subscription.id.to_string(),
            });
        }

        let cf_sub = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_by_customer = self.cf(cf::SUBSCRIPTIONS_BY_CUSTOMER)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sub, key, Self::serialize(subscription)?);
        batch.put_cf(
            &cf_by_customer,
            keys::customer_record_key(
                &subscription.merchant_id,
                &subscription.customer_id,
                subscription.id.to_bytes(),
            ),
            [],
        );
        self.write(batch)
    }

    fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.get(cf::SUBSCRIPTIONS, &keys::subscription_key(id))
    }

    fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: u64,
    ) -> Result<()> {
        let _guard = self.lock()?;
        let stored = self
            .get_subscription(&subscription.id)?
            .ok_or_else(|| StoreError::not_found("subscription", subscription.id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }

        let cf_sub = self.cf(cf::SUBSCRIPTIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_sub,
            keys::subscription_key(&subscription.id),
            Self::serialize(subscription)?,
        );
        self.write(batch)
    }

    fn list_customer_subscriptions(
        &self,
        merchant_id: &MerchantId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Subscription>> {
        let prefix = keys::customer_prefix(merchant_id, customer_id);
        let mut subscriptions = Vec::new();
        for key in self.scan_prefix(cf::SUBSCRIPTIONS_BY_CUSTOMER, &prefix)? {
            let id = SubscriptionId::from_bytes(keys::trailing_id(&key)?);
            if let Some(subscription) = self.get_subscription(&id)? {
                subscriptions.push(subscription);
            }
        }
        Ok(subscriptions)
    }

    fn list_due_subscriptions(&self, as_of: NaiveDate, limit: usize) -> Result<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .scan_values::<Subscription>(cf::SUBSCRIPTIONS)?
            .into_iter()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_billing_date <= as_of)
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
        let key = keys::merchant_scoped_key(&candidate.merchant_id, candidate.key.as_str());
        let _guard = self.lock()?;

        if let Some(existing) = self.get::<IdempotencyRecord>(cf::IDEMPOTENCY, &key)? {
            if existing.is_live(now) {
                return Ok(Reservation::Existing(existing));
            }
        }

        let cf = self.cf(cf::IDEMPOTENCY)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, key, Self::serialize(candidate)?);
        self.write(batch)?;
        Ok(Reservation::Acquired)
    }

    fn get_idempotency_record(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        self.get(
            cf::IDEMPOTENCY,
            &keys::merchant_scoped_key(merchant_id, key.as_str()),
        )
    }

    fn finalize_idempotency_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        result: LedgerResult,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let ledger_key = keys::merchant_scoped_key(merchant_id, key.as_str());
        let _guard = self.lock()?;
        let mut record = self
            .get::<IdempotencyRecord>(cf::IDEMPOTENCY, &ledger_key)?
            .ok_or_else(|| StoreError::not_found("idempotency_key", key))?;
        record.state = IdempotencyState::Finalized { result, expires_at };

        let cf = self.cf(cf::IDEMPOTENCY)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, ledger_key, Self::serialize(&record)?);
        self.write(batch)
    }

    fn release_idempotency_key(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<()> {
        let ledger_key = keys::merchant_scoped_key(merchant_id, key.as_str());
        let _guard = self.lock()?;
        let reserved = matches!(
            self.get::<IdempotencyRecord>(cf::IDEMPOTENCY, &ledger_key)?
                .map(|r| r.state),
            Some(IdempotencyState::Reserved { .. })
        );
        if reserved {
            let cf = self.cf(cf::IDEMPOTENCY)?;
            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf, ledger_key);
            self.write(batch)?;
        }
        Ok(())
    }

    fn purge_idempotency_records(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.lock()?;
        let cf = self.cf(cf::IDEMPOTENCY)?;

        let mut batch = WriteBatch::default();
        let mut purged = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let record: IdempotencyRecord = Self::deserialize(&value)?;
            if !record.is_live(now) {
                batch.delete_cf(&cf, key);
                purged += 1;
            }
        }
        self.write(batch)?;

        if purged > 0 {
            tracing::debug!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}
