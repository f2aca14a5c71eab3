//! Gateway protocol adapter for z-payments.
//!
//! Translates engine operations into the card/ACH processor's wire format
//! and back:
//!
//! - **Direct mode**: signed server-to-server form posts answered with
//!   tagged-field XML, classified as Approved / Declined / `ValidationRejected`.
//! - **Browser mode**: a key exchange yields a short-lived authorization code
//!   bound to one transaction number; the browser posts card data straight to
//!   the gateway, which later calls back with signed result fields.
//! - **Status query**: looks a transaction number up, used to resolve
//!   ambiguous submissions and ACH pre-notes.
//!
//! There is no process-wide client. A [`MerchantGateway`] pairs a
//! [`Gateway`] implementation with one merchant's credentials for the
//! duration of a call.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod callback;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fields;
pub mod response;
pub mod types;

pub use callback::CallbackFields;
pub use client::GatewayClient;
pub use config::{GatewayConfig, MerchantCredentials};
pub use error::GatewayError;
pub use fields::{BrowserOperation, TranType};
pub use types::{
    BrowserForm, DirectRequest, FieldMap, Funding, GatewayResponse, KeyExchangeRequest, Outcome,
    StatusResult,
};

use async_trait::async_trait;
use z_payments_core::TransactionNumber;

/// Transport to the processing gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Submit a direct request and classify the answer.
    ///
    /// # Errors
    ///
    /// Returns a `GatewayError` when no usable answer was obtained; check
    /// [`GatewayError::is_ambiguous`] to tell whether the gateway may have
    /// processed the request anyway.
    async fn submit(
        &self,
        credentials: &MerchantCredentials,
        request: &DirectRequest,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Exchange a browser payment declaration for an authorization code.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Rejected` if the gateway refuses the declaration.
    async fn exchange_key(
        &self,
        credentials: &MerchantCredentials,
        request: &KeyExchangeRequest,
    ) -> Result<String, GatewayError>;

    /// Look up a transaction by number.
    ///
    /// # Errors
    ///
    /// Returns a `GatewayError` when the gateway cannot be queried.
    async fn query_status(
        &self,
        credentials: &MerchantCredentials,
        transaction_number: &TransactionNumber,
    ) -> Result<StatusResult, GatewayError>;

    /// Endpoint browser forms post to.
    fn browser_post_url(&self) -> &str;
}

/// A gateway bound to one merchant's credentials for one call.
pub struct MerchantGateway<'a> {
    gateway: &'a dyn Gateway,
    credentials: MerchantCredentials,
}

impl<'a> MerchantGateway<'a> {
    /// Bind `gateway` to `credentials`.
    #[must_use]
    pub fn new(gateway: &'a dyn Gateway, credentials: MerchantCredentials) -> Self {
        Self {
            gateway,
            credentials,
        }
    }

    /// See [`Gateway::submit`].
    ///
    /// # Errors
    ///
    /// See [`Gateway::submit`].
    pub async fn submit(&self, request: &DirectRequest) -> Result<GatewayResponse, GatewayError> {
        self.gateway.submit(&self.credentials, request).await
    }

    /// Exchange a key and build the browser form for it.
    ///
    /// # Errors
    ///
    /// See [`Gateway::exchange_key`].
    pub async fn begin_browser(
        &self,
        request: &KeyExchangeRequest,
    ) -> Result<(String, BrowserForm), GatewayError> {
        let code = self.gateway.exchange_key(&self.credentials, request).await?;
        let form = self.browser_form(request, &code);
        Ok((code, form))
    }

    /// Build the browser form for an authorization code exchanged earlier.
    #[must_use]
    pub fn browser_form(&self, request: &KeyExchangeRequest, authorization_code: &str) -> BrowserForm {
        BrowserForm::new(
            self.gateway.browser_post_url(),
            &self.credentials,
            request,
            authorization_code,
        )
    }

    /// See [`Gateway::query_status`].
    ///
    /// # Errors
    ///
    /// See [`Gateway::query_status`].
    pub async fn query_status(
        &self,
        transaction_number: &TransactionNumber,
    ) -> Result<StatusResult, GatewayError> {
        self.gateway
            .query_status(&self.credentials, transaction_number)
            .await
    }

    /// Verify a callback's MAC with this merchant's secret.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidSignature` on mismatch.
    pub fn verify_callback(&self, callback: &CallbackFields) -> Result<(), GatewayError> {
        callback.verify(&self.credentials)
    }
}
