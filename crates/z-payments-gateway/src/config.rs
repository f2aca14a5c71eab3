//! Gateway endpoints and merchant credentials.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Gateway endpoint configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server-to-server submission endpoint.
    pub direct_url: String,

    /// Authorization-code (key) exchange endpoint.
    pub key_exchange_url: String,

    /// Endpoint the browser form posts card data to.
    pub browser_post_url: String,

    /// Transaction status query endpoint.
    pub status_url: String,

    /// Request timeout (default: 30s).
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Sandbox base URL used when no endpoint is configured.
    pub const SANDBOX_BASE_URL: &'static str = "https://sandbox.gateway.example.com";

    /// Build a configuration with every endpoint under one base URL.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            direct_url: format!("{base}/direct"),
            key_exchange_url: format!("{base}/keyexchange"),
            browser_post_url: format!("{base}/browserpost"),
            status_url: format!("{base}/status"),
            timeout: Duration::from_secs(30),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `GATEWAY_BASE_URL` sets every endpoint; `GATEWAY_DIRECT_URL`,
    /// `GATEWAY_KEY_EXCHANGE_URL`, `GATEWAY_BROWSER_POST_URL` and
    /// `GATEWAY_STATUS_URL` override individual ones.
    #[must_use]
    pub fn from_env() -> Self {
        let base = std::env::var("GATEWAY_BASE_URL")
            .unwrap_or_else(|_| Self::SANDBOX_BASE_URL.into());
        let defaults = Self::with_base_url(&base);

        Self {
            direct_url: std::env::var("GATEWAY_DIRECT_URL").unwrap_or(defaults.direct_url),
            key_exchange_url: std::env::var("GATEWAY_KEY_EXCHANGE_URL")
                .unwrap_or(defaults.key_exchange_url),
            browser_post_url: std::env::var("GATEWAY_BROWSER_POST_URL")
                .unwrap_or(defaults.browser_post_url),
            status_url: std::env::var("GATEWAY_STATUS_URL").unwrap_or(defaults.status_url),
            timeout: std::env::var("GATEWAY_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.timeout, Duration::from_secs),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::with_base_url(Self::SANDBOX_BASE_URL)
    }
}

/// A merchant's gateway numbers and signing secret.
///
/// Supplied per call by the credential collaborator; never persisted.
#[derive(Clone, Deserialize)]
pub struct MerchantCredentials {
    /// Customer number.
    pub cust_nbr: String,
    /// Merchant number.
    pub merch_nbr: String,
    /// DBA number.
    pub dba_nbr: String,
    /// Terminal number.
    pub terminal_nbr: String,
    /// Shared MAC secret.
    pub mac_secret: String,
}

impl fmt::Debug for MerchantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerchantCredentials")
            .field("cust_nbr", &self.cust_nbr)
            .field("merch_nbr", &self.merch_nbr)
            .field("dba_nbr", &self.dba_nbr)
            .field("terminal_nbr", &self.terminal_nbr)
            .field("mac_secret", &"[redacted]")
            .finish()
    }
}
