//! The engine handle shared by every operation.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use z_payments_core::{
    MerchantId, PaymentError, PaymentMethod, PaymentMethodId, Result, Subscription,
    SubscriptionId, Transaction, TransactionId,
};
use z_payments_gateway::{Gateway, MerchantGateway};
use z_payments_store::Store;

use crate::collaborators::{AccessControl, Caller, CredentialProvider, Scope};
use crate::config::EngineConfig;

/// The payment transaction engine.
///
/// Cheap to share behind an `Arc`; holds no per-merchant state besides the
/// billing rate limiter.
pub struct PaymentEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) config: EngineConfig,
    pub(crate) limiter: DefaultKeyedRateLimiter<MerchantId>,
}

impl PaymentEngine {
    /// Assemble an engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn Gateway>,
        credentials: Arc<dyn CredentialProvider>,
        access: Arc<dyn AccessControl>,
        config: EngineConfig,
    ) -> Self {
        let per_minute =
            NonZeroU32::new(config.billing.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::keyed(Quota::per_minute(per_minute));

        Self {
            store,
            gateway,
            credentials,
            access,
            config,
            limiter,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) async fn check_scope(&self, caller: &Caller, scope: Scope) -> Result<()> {
        if self
            .access
            .check_access(caller, &caller.merchant_id, scope)
            .await
        {
            Ok(())
        } else {
            tracing::warn!(
                principal = %caller.principal,
                merchant_id = %caller.merchant_id,
                scope = %scope,
                "Access denied"
            );
            Err(PaymentError::Forbidden {
                scope: scope.to_string(),
            })
        }
    }

    /// Bind the gateway to a merchant's credentials for one call.
    pub(crate) async fn merchant_gateway(
        &self,
        merchant_id: &MerchantId,
    ) -> Result<MerchantGateway<'_>> {
        let credentials = self.credentials.credentials(merchant_id).await?;
        Ok(MerchantGateway::new(self.gateway.as_ref(), credentials))
    }

    // =========================================================================
    // Merchant-scoped loads
    // =========================================================================

    /// Load a transaction, hiding other merchants' records.
    pub(crate) fn load_transaction(
        &self,
        merchant_id: &MerchantId,
        id: &TransactionId,
    ) -> Result<Transaction> {
        self.store
            .get_transaction(id)?
            .filter(|t| t.merchant_id == *merchant_id)
            .ok_or_else(|| PaymentError::not_found("transaction", id))
    }

    pub(crate) fn load_payment_method(
        &self,
        merchant_id: &MerchantId,
        id: &PaymentMethodId,
    ) -> Result<PaymentMethod> {
        self.store
            .get_payment_method(id)?
            .filter(|m| m.merchant_id == *merchant_id)
            .ok_or_else(|| PaymentError::not_found("payment method", id))
    }

    pub(crate) fn load_subscription(
        &self,
        merchant_id: &MerchantId,
        id: &SubscriptionId,
    ) -> Result<Subscription> {
        self.store
            .get_subscription(id)?
            .filter(|s| s.merchant_id == *merchant_id)
            .ok_or_else(|| PaymentError::not_found("subscription", id))
    }
}
