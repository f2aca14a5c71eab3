//! Payment transaction engine for z-payments.
//!
//! Sits between merchant applications and the card/ACH gateway:
//!
//! - **Idempotency ledger**: every mutating call runs at most once per
//!   `(merchant, key)`; retries replay the stored result.
//! - **State machine**: authorizations, sales, captures, refunds and voids
//!   with guarded status transitions and cumulative amount limits.
//! - **Browser flow**: key exchange up front, signed callback later.
//! - **Reconciliation**: ambiguous submissions resolved by status query.
//! - **ACH tracker**: pre-note verification of saved bank accounts.
//! - **Recurring billing**: crash-safe charging of due subscriptions.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use z_payments_engine::{AllowAll, EngineConfig, PaymentEngine, StaticCredentials};
//! use z_payments_gateway::{GatewayClient, GatewayConfig};
//! use z_payments_store::MemoryStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = PaymentEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(GatewayClient::new(GatewayConfig::default())?),
//!     Arc::new(StaticCredentials::load(None)),
//!     Arc::new(AllowAll),
//!     EngineConfig::from_env(),
//! );
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ach;
pub mod billing;
pub mod browser;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod linkage;
pub mod reconcile;
pub mod subscriptions;
pub mod transactions;

mod ledger;

pub use ach::{AchReconcileReport, StoreAchAccountRequest, StoredAchAccount, VerifyAchAccountRequest};
pub use billing::{BillingFailure, BillingReport};
pub use browser::{BrowserPaymentRequest, BrowserSession, CallbackAck, CallbackOutcome};
pub use collaborators::{
    AccessControl, AllowAll, Caller, CredentialProvider, Scope, StaticCredentials,
};
pub use config::{BillingPolicy, EngineConfig};
pub use engine::PaymentEngine;
pub use linkage::remaining_amount;
pub use reconcile::ReconcileSummary;
pub use subscriptions::{CreateSubscriptionRequest, UpdateSubscriptionRequest};
pub use transactions::{AchCreditRequest, ChargeRequest, FollowUpRequest, MAX_PAGE_SIZE};
