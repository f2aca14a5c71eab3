//! HTTP implementation of the [`Gateway`] trait.

use async_trait::async_trait;
use reqwest::Client;
use url::Url;
use z_payments_core::TransactionNumber;

use crate::config::{GatewayConfig, MerchantCredentials};
use crate::crypto::sign_fields;
use crate::error::GatewayError;
use crate::fields;
use crate::response::{parse_key_exchange, parse_response, parse_status};
use crate::types::{DirectRequest, FieldMap, GatewayResponse, KeyExchangeRequest, StatusResult};
use crate::Gateway;

/// Gateway client over HTTPS form posts.
///
/// Holds no merchant state: credentials are passed per call.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
}

impl GatewayClient {
    /// Create a client for the configured endpoints.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if an endpoint is not a valid
    /// URL or the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        for endpoint in [
            &config.direct_url,
            &config.key_exchange_url,
            &config.browser_post_url,
            &config.status_url,
        ] {
            Url::parse(endpoint)
                .map_err(|e| GatewayError::Configuration(format!("invalid URL {endpoint}: {e}")))?;
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// The endpoint configuration.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Sign a field set and post it, returning the response body.
    async fn post_signed(
        &self,
        url: &str,
        credentials: &MerchantCredentials,
        mut form: FieldMap,
    ) -> Result<String, GatewayError> {
        let mac = sign_fields(&credentials.mac_secret, &form);
        form.insert(fields::MAC.into(), mac);

        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(&e))
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn submit(
        &self,
        credentials: &MerchantCredentials,
        request: &DirectRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!(
            tran_type = request.tran_type.code(),
            transaction_number = %request.transaction_number,
            amount_minor = request.amount_minor,
            "Submitting direct gateway request"
        );

        let body = self
            .post_signed(
                &self.config.direct_url,
                credentials,
                request.to_fields(credentials),
            )
            .await
            .map_err(|e| {
                tracing::warn!(
                    transaction_number = %request.transaction_number,
                    error = %e,
                    "Direct gateway request failed"
                );
                e
            })?;

        let response = parse_response(&body)?;
        if response.is_approved() {
            tracing::info!(
                transaction_number = %request.transaction_number,
                response_code = %response.response_code,
                "Gateway approved request"
            );
        } else {
            tracing::warn!(
                transaction_number = %request.transaction_number,
                outcome = ?response.outcome,
                response_code = %response.response_code,
                "Gateway did not approve request"
            );
        }
        Ok(response)
    }

    async fn exchange_key(
        &self,
        credentials: &MerchantCredentials,
        request: &KeyExchangeRequest,
    ) -> Result<String, GatewayError> {
        tracing::debug!(
            transaction_number = %request.transaction_number,
            operation = request.operation.group(),
            "Requesting browser authorization code"
        );

        let body = self
            .post_signed(
                &self.config.key_exchange_url,
                credentials,
                request.to_fields(credentials),
            )
            .await?;
        parse_key_exchange(&body)
    }

    async fn query_status(
        &self,
        credentials: &MerchantCredentials,
        transaction_number: &TransactionNumber,
    ) -> Result<StatusResult, GatewayError> {
        tracing::debug!(
            transaction_number = %transaction_number,
            "Querying gateway transaction status"
        );

        let mut form = FieldMap::new();
        form.insert(fields::CUST_NBR.into(), credentials.cust_nbr.clone());
        form.insert(fields::MERCH_NBR.into(), credentials.merch_nbr.clone());
        form.insert(fields::DBA_NBR.into(), credentials.dba_nbr.clone());
        form.insert(fields::TERMINAL_NBR.into(), credentials.terminal_nbr.clone());
        form.insert(fields::TRAN_NBR.into(), transaction_number.to_string());

        let body = self
            .post_signed(&self.config.status_url, credentials, form)
            .await?;
        parse_status(&body)
    }

    fn browser_post_url(&self) -> &str {
        &self.config.browser_post_url
    }
}
