//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Unique index: `merchant_id || idempotency_key` -> `transaction_id`.
    pub const TRANSACTIONS_BY_KEY: &str = "transactions_by_key";

    /// Unique index: `merchant_id || transaction_number` -> `transaction_id`.
    pub const TRANSACTIONS_BY_NUMBER: &str = "transactions_by_number";

    /// Index: transactions by merchant, keyed by `merchant_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_MERCHANT: &str = "transactions_by_merchant";

    /// Index: children by parent, keyed by `parent_id || child_id`.
    /// Value is empty (index only).
    pub const TRANSACTION_CHILDREN: &str = "transaction_children";

    /// Saved payment methods, keyed by `payment_method_id`.
    pub const PAYMENT_METHODS: &str = "payment_methods";

    /// Index: `merchant_id || customer_id || payment_method_id`, empty value.
    pub const PAYMENT_METHODS_BY_CUSTOMER: &str = "payment_methods_by_customer";

    /// ACH verifications, keyed by `payment_method_id`.
    pub const ACH_VERIFICATIONS: &str = "ach_verifications";

    /// Subscriptions, keyed by `subscription_id` (ULID).
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Index: `merchant_id || customer_id || subscription_id`, empty value.
    pub const SUBSCRIPTIONS_BY_CUSTOMER: &str = "subscriptions_by_customer";

    /// Idempotency ledger, keyed by `merchant_id || idempotency_key`.
    pub const IDEMPOTENCY: &str = "idempotency";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_KEY,
        cf::TRANSACTIONS_BY_NUMBER,
        cf::TRANSACTIONS_BY_MERCHANT,
        cf::TRANSACTION_CHILDREN,
        cf::PAYMENT_METHODS,
        cf::PAYMENT_METHODS_BY_CUSTOMER,
        cf::ACH_VERIFICATIONS,
        cf::SUBSCRIPTIONS,
        cf::SUBSCRIPTIONS_BY_CUSTOMER,
        cf::IDEMPOTENCY,
    ]
}
