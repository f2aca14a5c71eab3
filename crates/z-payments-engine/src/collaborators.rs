//! Collaborator seams the engine consumes but does not implement.
//!
//! Authentication happens upstream; the engine only asks an
//! [`AccessControl`] whether an already-identified caller may act on a
//! merchant with a given scope. Gateway secrets come from a
//! [`CredentialProvider`] on every call and are never persisted.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use z_payments_core::{MerchantId, PaymentError, Result};
use z_payments_gateway::MerchantCredentials;

// ============================================================================
// Access control
// ============================================================================

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Who is calling (service name, API key label).
    pub principal: String,
    /// Merchant the caller acts for.
    pub merchant_id: MerchantId,
}

impl Caller {
    /// Create a caller.
    #[must_use]
    pub fn new(principal: impl Into<String>, merchant_id: MerchantId) -> Self {
        Self {
            principal: principal.into(),
            merchant_id,
        }
    }
}

/// Capability required by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Create or change transactions and payment methods.
    #[serde(rename = "payments:write")]
    PaymentsWrite,
    /// Read transactions and payment methods.
    #[serde(rename = "payments:read")]
    PaymentsRead,
    /// Create or change subscriptions.
    #[serde(rename = "subscriptions:write")]
    SubscriptionsWrite,
    /// Read subscriptions.
    #[serde(rename = "subscriptions:read")]
    SubscriptionsRead,
}

impl Scope {
    /// Scope name as granted by the identity collaborator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaymentsWrite => "payments:write",
            Self::PaymentsRead => "payments:read",
            Self::SubscriptionsWrite => "subscriptions:write",
            Self::SubscriptionsRead => "subscriptions:read",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability check answered by the identity collaborator.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Whether `caller` may act on `merchant_id` with `scope`.
    async fn check_access(&self, caller: &Caller, merchant_id: &MerchantId, scope: Scope) -> bool;
}

/// Grants every scope to a caller acting on its own merchant.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn check_access(&self, caller: &Caller, merchant_id: &MerchantId, _scope: Scope) -> bool {
        caller.merchant_id == *merchant_id
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Supplies a merchant's gateway numbers and signing secret.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials for `merchant_id`.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Configuration` if the merchant has none.
    async fn credentials(&self, merchant_id: &MerchantId) -> Result<MerchantCredentials>;
}

/// Credentials held in memory, loaded from a secrets file or the environment.
///
/// The secrets file is a JSON object keyed by merchant id:
///
/// ```json
/// { "5f0c...": { "cust_nbr": "9001", "merch_nbr": "900300", "dba_nbr": "2",
///               "terminal_nbr": "77", "mac_secret": "..." } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_merchant: HashMap<MerchantId, MerchantCredentials>,
}

impl StaticCredentials {
    /// An empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a merchant's credentials.
    #[must_use]
    pub fn with(mut self, merchant_id: MerchantId, credentials: MerchantCredentials) -> Self {
        self.by_merchant.insert(merchant_id, credentials);
        self
    }

    /// Number of merchants configured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_merchant.len()
    }

    /// Whether no merchant is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_merchant.is_empty()
    }

    /// Load a secrets file.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Configuration` if the file cannot be read or a
    /// key is not a merchant id.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PaymentError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let raw: HashMap<String, MerchantCredentials> = serde_json::from_str(&contents)
            .map_err(|e| PaymentError::Configuration(format!("invalid {}: {e}", path.display())))?;

        let mut by_merchant = HashMap::with_capacity(raw.len());
        for (merchant, credentials) in raw {
            let merchant_id: MerchantId = merchant.parse().map_err(|_| {
                PaymentError::Configuration(format!("invalid merchant id {merchant:?}"))
            })?;
            by_merchant.insert(merchant_id, credentials);
        }
        Ok(Self { by_merchant })
    }

    /// Load credentials from the first secrets file found, falling back to a
    /// single merchant described by `GATEWAY_MERCHANT_ID`, `GATEWAY_CUST_NBR`,
    /// `GATEWAY_MERCH_NBR`, `GATEWAY_DBA_NBR`, `GATEWAY_TERMINAL_NBR` and
    /// `GATEWAY_MAC_SECRET`.
    #[must_use]
    pub fn load(explicit_path: Option<&str>) -> Self {
        let secret_paths = [".secrets/gateway.json", "../.secrets/gateway.json"];

        for path in explicit_path.into_iter().chain(secret_paths) {
            if !Path::new(path).exists() {
                continue;
            }
            match Self::from_file(path) {
                Ok(loaded) => {
                    tracing::info!(path = %path, merchants = loaded.len(), "Loaded gateway credentials from file");
                    return loaded;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "Ignoring unreadable credentials file"),
            }
        }

        tracing::debug!("Gateway credentials file not found, using environment variables");
        Self::from_env()
    }

    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let Some(merchant_id) = var("GATEWAY_MERCHANT_ID").and_then(|s| s.parse().ok()) else {
            return Self::new();
        };
        let (Some(cust_nbr), Some(merch_nbr), Some(dba_nbr), Some(terminal_nbr), Some(mac_secret)) = (
            var("GATEWAY_CUST_NBR"),
            var("GATEWAY_MERCH_NBR"),
            var("GATEWAY_DBA_NBR"),
            var("GATEWAY_TERMINAL_NBR"),
            var("GATEWAY_MAC_SECRET"),
        ) else {
            tracing::warn!("GATEWAY_MERCHANT_ID is set but gateway numbers are incomplete");
            return Self::new();
        };

        Self::new().with(
            merchant_id,
            MerchantCredentials {
                cust_nbr,
                merch_nbr,
                dba_nbr,
                terminal_nbr,
                mac_secret,
            },
        )
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self, merchant_id: &MerchantId) -> Result<MerchantCredentials> {
        self.by_merchant.get(merchant_id).cloned().ok_or_else(|| {
            PaymentError::Configuration(format!("no gateway credentials for merchant {merchant_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn allow_all_is_merchant_bound() {
        let merchant = MerchantId::generate();
        let caller = Caller::new("svc", merchant);
        assert!(
            AllowAll
                .check_access(&caller, &merchant, Scope::PaymentsWrite)
                .await
        );
        assert!(
            !AllowAll
                .check_access(&caller, &MerchantId::generate(), Scope::PaymentsRead)
                .await
        );
    }

    #[tokio::test]
    async fn loads_secrets_file() {
        let merchant = MerchantId::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"{merchant}": {{"cust_nbr":"9001","merch_nbr":"900300","dba_nbr":"2","terminal_nbr":"77","mac_secret":"s3cret"}}}}"#
        )
        .unwrap();

        let provider = StaticCredentials::from_file(file.path()).unwrap();
        let creds = provider.credentials(&merchant).await.unwrap();
        assert_eq!(creds.merch_nbr, "900300");

        let missing = provider.credentials(&MerchantId::generate()).await;
        assert!(matches!(missing, Err(PaymentError::Configuration(_))));
    }

    #[test]
    fn rejects_bad_merchant_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"not-a-uuid": {{"cust_nbr":"1","merch_nbr":"2","dba_nbr":"3","terminal_nbr":"4","mac_secret":"s"}}}}"#).unwrap();
        assert!(StaticCredentials::from_file(file.path()).is_err());
    }

    #[test]
    fn scope_names() {
        assert_eq!(Scope::SubscriptionsRead.to_string(), "subscriptions:read");
        assert_eq!(
            serde_json::to_string(&Scope::PaymentsWrite).unwrap(),
            "\"payments:write\""
        );
    }
}
