//! Core types and utilities for z-payments.
//!
//! This crate provides the foundational types used throughout the payment
//! transaction engine:
//!
//! - **Identifiers**: `MerchantId`, `CustomerId`, `TransactionId`, `TransactionNumber`
//! - **Money**: integer minor units, exact decimal-string conversion
//! - **Transactions**: `Transaction`, the status state machine, parent/child rules
//! - **Payment methods**: `PaymentMethod`, `PaymentMethodRef`, `AchVerification`
//! - **Subscriptions**: `Subscription`, `BillingInterval`, failure handling
//! - **Idempotency**: `IdempotencyKey`, `IdempotencyRecord`, `Processed`
//!
//! # Amounts
//!
//! Every amount is an `i64` count of minor units (cents). The gateway's
//! decimal strings are converted exactly at the adapter boundary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod idempotency;
pub mod ids;
pub mod money;
pub mod payment_method;
pub mod subscription;
pub mod transaction;

pub use error::{PaymentError, Result};
pub use idempotency::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, LedgerResult, Processed,
    RequestFingerprint, MAX_IDEMPOTENCY_KEY_LEN,
};
pub use ids::{
    CustomerId, IdError, MerchantId, PaymentMethodId, SubscriptionId, TransactionId,
    TransactionNumber,
};
pub use money::{
    parse_decimal_string, to_decimal_string, validate_amount, Currency, MoneyError,
    MAX_AMOUNT_MINOR, MIN_AMOUNT_MINOR,
};
pub use payment_method::{
    AchAccountDetails, AchAccountType, AchVerification, PaymentMethod, VerificationStatus,
};
pub use subscription::{
    BillingInterval, FailureDisposition, FailureOption, IntervalUnit, Subscription,
    SubscriptionStatus, DEFAULT_MAX_RETRIES,
};
pub use transaction::{
    validate_metadata, BrowserContext, GatewayResult, GatewayToken, Metadata, PaymentMethodRef,
    PaymentMethodType, Transaction, TransactionFilter, TransactionStatus, TransactionType,
};
