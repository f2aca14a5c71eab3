//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use z_payments_core::{
    CustomerId, MerchantId, PaymentMethodId, SubscriptionId, TransactionId, TransactionNumber,
};

use crate::error::{Result, StoreError};

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a merchant-scoped string key.
///
/// Format: `merchant_id (16 bytes) || value`
///
/// Used by the idempotency-key and transaction-number indexes and the ledger.
#[must_use]
pub fn merchant_scoped_key(merchant_id: &MerchantId, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + value.len());
    key.extend_from_slice(merchant_id.as_bytes());
    key.extend_from_slice(value.as_bytes());
    key
}

/// Create a transaction-number index key.
#[must_use]
pub fn transaction_number_key(merchant_id: &MerchantId, number: &TransactionNumber) -> Vec<u8> {
    merchant_scoped_key(merchant_id, number.as_str())
}

/// Create a merchant-transaction index key.
///
/// Format: `merchant_id (16 bytes) || transaction_id (16 bytes)`
///
/// Since ULIDs are time-ordered, a merchant's transactions sort by time.
#[must_use]
pub fn merchant_transaction_key(merchant_id: &MerchantId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(merchant_id.as_bytes());
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create a parent-child index key.
///
/// Format: `parent_id (16 bytes) || child_id (16 bytes)`
#[must_use]
pub fn child_key(parent_id: &TransactionId, child_id: &TransactionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&parent_id.to_bytes());
    key.extend_from_slice(&child_id.to_bytes());
    key
}

/// Create a payment method key.
#[must_use]
pub fn payment_method_key(payment_method_id: &PaymentMethodId) -> Vec<u8> {
    payment_method_id.as_bytes().to_vec()
}

/// Create a subscription key.
#[must_use]
pub fn subscription_key(subscription_id: &SubscriptionId) -> Vec<u8> {
    subscription_id.to_bytes().to_vec()
}

/// Create a customer prefix: `merchant_id (16 bytes) || customer_id (16 bytes)`.
#[must_use]
pub fn customer_prefix(merchant_id: &MerchantId, customer_id: &CustomerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(merchant_id.as_bytes());
    key.extend_from_slice(customer_id.as_bytes());
    key
}

/// Append a 16-byte record ID to a customer prefix.
#[must_use]
pub fn customer_record_key(
    merchant_id: &MerchantId,
    customer_id: &CustomerId,
    record_id: [u8; 16],
) -> Vec<u8> {
    let mut key = customer_prefix(merchant_id, customer_id);
    key.extend_from_slice(&record_id);
    key
}

/// Read the trailing 16-byte record ID of an index key.
///
/// # Errors
///
/// Returns `StoreError::Database` if the key is shorter than 16 bytes.
pub fn trailing_id(key: &[u8]) -> Result<[u8; 16]> {
    let start = key
        .len()
        .checked_sub(16)
        .ok_or_else(|| StoreError::Database(format!("index key too short: {} bytes", key.len())))?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[start..]);
    Ok(bytes)
}
