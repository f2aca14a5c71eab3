//! Browser-redirect payments.
//!
//! The flow has two independent entry points. `begin_browser_payment`
//! exchanges a short-lived authorization code bound to a transaction number
//! and records a `Pending` transaction carrying it. Some time later the
//! gateway posts the result to `resolve_callback`, which finds that record by
//! transaction number and resolves it. The callback never fails at the
//! transport level: every outcome is reported through a [`CallbackAck`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use z_payments_core::{
    validate_amount, validate_metadata, BrowserContext, CustomerId, Currency, GatewayToken,
    IdempotencyKey, LedgerResult, MerchantId, Metadata, PaymentError, PaymentMethod,
    PaymentMethodId, PaymentMethodRef, PaymentMethodType, Processed, RequestFingerprint, Result,
    Transaction, TransactionId, TransactionNumber, TransactionStatus, TransactionType,
};
use z_payments_gateway::{
    BrowserForm, BrowserOperation, CallbackFields, GatewayResponse, KeyExchangeRequest,
    MerchantGateway, Outcome,
};
use z_payments_store::{StoreError, TransactionUpdate, MAX_NUMBER_ATTEMPTS};

use crate::collaborators::{Caller, Scope};
use crate::config::chrono_duration;
use crate::engine::PaymentEngine;
use crate::ledger::{unexpected_entry, LedgerEntry};
use crate::transactions::{describe_metadata, Draft};

/// A browser payment to declare before rendering the payment form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserPaymentRequest {
    /// Customer paying. Required when `tokenize` is set.
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Currency (default USD).
    #[serde(default)]
    pub currency: Currency,
    /// Authorize only, or authorize and capture.
    pub operation: BrowserOperation,
    /// Save the card as a payment method on approval.
    #[serde(default)]
    pub tokenize: bool,
    /// Merchant page the browser returns to.
    pub return_url: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A declared browser payment and the form that submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSession {
    /// The `Pending` transaction awaiting the callback.
    pub transaction: Transaction,
    /// Form to render; the browser adds the card fields.
    pub form: BrowserForm,
    /// When the authorization code stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl LedgerEntry for BrowserSession {
    fn ledger_result(&self) -> LedgerResult {
        LedgerResult::Transaction(self.transaction.id)
    }
}

/// How a callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// The pending transaction was resolved.
    Resolved,
    /// The transaction was already resolved; nothing changed.
    Duplicate,
    /// No pending browser transaction has this number for the merchant.
    UnknownTransaction,
    /// The MAC did not verify.
    InvalidSignature,
    /// The fields could not be interpreted.
    Malformed,
    /// An internal failure; the gateway's result was not recorded.
    Error,
}

/// Acknowledgement of a gateway callback.
///
/// Always answered with a success status at the transport level; when a
/// return address is known the browser is redirected there with `status`,
/// `transaction_id` and `response_code` query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackAck {
    /// How the callback was handled.
    pub outcome: CallbackOutcome,
    /// Transaction addressed by the callback, when known.
    pub transaction_id: Option<TransactionId>,
    /// Its status after handling.
    pub status: Option<TransactionStatus>,
    /// Gateway response code stored on it.
    pub response_code: Option<String>,
    /// Where to redirect the browser.
    pub redirect_url: Option<String>,
}

impl CallbackAck {
    fn bare(outcome: CallbackOutcome) -> Self {
        Self {
            outcome,
            transaction_id: None,
            status: None,
            response_code: None,
            redirect_url: None,
        }
    }

    fn for_transaction(outcome: CallbackOutcome, txn: &Transaction) -> Self {
        Self {
            outcome,
            transaction_id: Some(txn.id),
            status: Some(txn.status),
            response_code: txn.gateway_response_code.clone(),
            redirect_url: redirect_url(txn),
        }
    }
}

/// The merchant return address with the outcome appended.
fn redirect_url(txn: &Transaction) -> Option<String> {
    let context = txn.browser.as_ref()?;
    let mut url = Url::parse(&context.return_url).ok()?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("status", txn.status.as_str());
        query.append_pair("transaction_id", &txn.id.to_string());
        if let Some(code) = &txn.gateway_response_code {
            query.append_pair("response_code", code);
        }
    }
    Some(url.into())
}

fn validate_return_url(return_url: &str) -> Result<()> {
    let url = Url::parse(return_url)
        .map_err(|e| PaymentError::Validation(format!("invalid return url: {e}")))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(PaymentError::Validation(
            "return url must be http or https".into(),
        ));
    }
    Ok(())
}

const fn browser_operation(transaction_type: TransactionType) -> BrowserOperation {
    match transaction_type {
        TransactionType::Sale => BrowserOperation::Sale,
        _ => BrowserOperation::Authorization,
    }
}

/// Rebuild the session of an already declared browser payment.
fn restore_session(gateway: &MerchantGateway<'_>, txn: Transaction) -> Result<BrowserSession> {
    let context = txn.browser.as_ref().ok_or_else(|| {
        PaymentError::StateConflict(format!("transaction {} is not a browser payment", txn.id))
    })?;
    let request = KeyExchangeRequest {
        transaction_number: txn.transaction_number.clone(),
        amount_minor: txn.amount_minor,
        operation: browser_operation(txn.transaction_type),
        return_url: context.return_url.clone(),
        tokenize: context.tokenize,
    };
    let form = gateway.browser_form(&request, &context.authorization_code);
    let expires_at = context.expires_at;
    Ok(BrowserSession {
        transaction: txn,
        form,
        expires_at,
    })
}

impl PaymentEngine {
    /// Declare a browser payment and get the form that submits it.
    ///
    /// Replays with the same key return the same session.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad amounts, return URLs or a tokenizing request
    ///   without a customer.
    /// - `Declined` if the gateway refuses the declaration.
    /// - `GatewayUnavailable` if the key exchange fails; nothing is recorded.
    pub async fn begin_browser_payment(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: BrowserPaymentRequest,
    ) -> Result<Processed<BrowserSession>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        validate_amount(request.amount_minor)?;
        validate_metadata(&request.metadata)?;
        validate_return_url(&request.return_url)?;
        if request.tokenize && request.customer_id.is_none() {
            return Err(PaymentError::Validation(
                "saving a card requires a customer".into(),
            ));
        }

        let fingerprint = RequestFingerprint::builder("browser")
            .field("operation", request.operation.group())
            .field("amount", request.amount_minor)
            .field("currency", &request.currency)
            .field("tokenize", request.tokenize)
            .field("return_url", &request.return_url)
            .opt_field("customer", request.customer_id)
            .field("metadata", describe_metadata(&request.metadata))
            .finish();
        let merchant_id = caller.merchant_id;
        let fingerprint = &fingerprint;

        self.run_idempotent(
            &merchant_id,
            key,
            fingerprint,
            |result| async move {
                let LedgerResult::Transaction(id) = result else {
                    return Err(unexpected_entry(key, result));
                };
                let txn = self.load_transaction(&merchant_id, &id)?;
                let gateway = self.merchant_gateway(&merchant_id).await?;
                restore_session(&gateway, txn)
            },
            || async move {
                let gateway = self.merchant_gateway(&merchant_id).await?;

                if let Some(existing) = self.store.find_transaction_by_key(&merchant_id, key)? {
                    if existing.browser.is_none() {
                        return Err(PaymentError::IdempotencyConflict {
                            key: key.to_string(),
                        });
                    }
                    existing.check_fingerprint(&fingerprint)?;
                    return restore_session(&gateway, existing).map(Processed::replayed);
                }

                let exchange = KeyExchangeRequest {
                    transaction_number: self.free_transaction_number(&merchant_id, key)?,
                    amount_minor: request.amount_minor,
                    operation: request.operation,
                    return_url: request.return_url.clone(),
                    tokenize: request.tokenize,
                };
                let (authorization_code, form) =
                    gateway.begin_browser(&exchange).await.map_err(|e| {
                        tracing::warn!(merchant_id = %merchant_id, error = %e, "Key exchange failed");
                        PaymentError::from(e)
                    })?;

                let expires_at =
                    Utc::now() + chrono_duration(self.config.authorization_code_validity);
                let mut txn = Draft {
                    transaction_type: request.operation.transaction_type(),
                    payment_method_type: PaymentMethodType::CreditCard,
                    amount_minor: request.amount_minor,
                    currency: request.currency,
                    customer_id: request.customer_id,
                    payment_method: None,
                    parent_transaction_id: None,
                    browser: Some(BrowserContext {
                        authorization_code,
                        expires_at,
                        return_url: request.return_url,
                        tokenize: request.tokenize,
                    }),
                    metadata: request.metadata,
                }
                .into_transaction(merchant_id, key.as_str(), &fingerprint);
                txn.transaction_number = exchange.transaction_number.clone();
                self.store.insert_transaction(&mut txn)?;
                if txn.transaction_number != exchange.transaction_number {
                    // The code is bound to the exchanged number, which another
                    // key took between the exchange and the insert.
                    self.discard_pending(&txn);
                    return Err(PaymentError::GatewayUnavailable(format!(
                        "transaction number {} was taken during key exchange",
                        exchange.transaction_number
                    )));
                }

                tracing::info!(
                    transaction_id = %txn.id,
                    transaction_number = %txn.transaction_number,
                    merchant_id = %merchant_id,
                    "Browser payment declared"
                );
                Ok(Processed::fresh(BrowserSession {
                    transaction: txn,
                    form,
                    expires_at,
                }))
            },
        )
        .await
    }

    /// First number derived for `key` that no other record of the merchant
    /// carries. The key exchange binds it before the record exists.
    fn free_transaction_number(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
    ) -> Result<TransactionNumber> {
        for attempt in 0..MAX_NUMBER_ATTEMPTS {
            let number = TransactionNumber::derive_attempt(merchant_id, key.as_str(), attempt);
            if self.store.find_transaction_by_number(merchant_id, &number)?.is_none() {
                return Ok(number);
            }
            tracing::warn!(
                merchant_id = %merchant_id,
                transaction_number = %number,
                "Transaction number already in use, re-deriving"
            );
        }
        Err(PaymentError::StateConflict(format!(
            "no free transaction number for key {key}"
        )))
    }

    // =========================================================================
    // Callback
    // =========================================================================

    /// Resolve a gateway callback for `merchant_id`.
    ///
    /// Never fails: every outcome, including internal errors, is reported in
    /// the acknowledgement so the transport can answer with success.
    pub async fn resolve_callback(
        &self,
        merchant_id: &MerchantId,
        callback: &CallbackFields,
    ) -> CallbackAck {
        match self.try_resolve_callback(merchant_id, callback).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(merchant_id = %merchant_id, error = %e, "Callback handling failed");
                CallbackAck::bare(CallbackOutcome::Error)
            }
        }
    }

    async fn try_resolve_callback(
        &self,
        merchant_id: &MerchantId,
        callback: &CallbackFields,
    ) -> Result<CallbackAck> {
        let gateway = self.merchant_gateway(merchant_id).await?;
        if gateway.verify_callback(callback).is_err() {
            tracing::warn!(merchant_id = %merchant_id, "Callback signature mismatch");
            return Ok(CallbackAck::bare(CallbackOutcome::InvalidSignature));
        }

        let Ok(number) = callback.transaction_number() else {
            tracing::warn!(merchant_id = %merchant_id, "Callback without a usable transaction number");
            return Ok(CallbackAck::bare(CallbackOutcome::Malformed));
        };

        let txn = match self.store.find_transaction_by_number(merchant_id, &number)? {
            Some(txn) if txn.browser.is_some() => txn,
            _ => {
                tracing::warn!(
                    merchant_id = %merchant_id,
                    transaction_number = %number,
                    "Callback for unknown transaction"
                );
                return Ok(CallbackAck::bare(CallbackOutcome::UnknownTransaction));
            }
        };

        if !txn.status.is_unresolved() {
            tracing::info!(transaction_id = %txn.id, status = ?txn.status, "Duplicate callback");
            return Ok(CallbackAck::for_transaction(CallbackOutcome::Duplicate, &txn));
        }

        let response = match callback.classify() {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(transaction_id = %txn.id, error = %e, "Malformed callback");
                return Ok(CallbackAck::for_transaction(CallbackOutcome::Malformed, &txn));
            }
        };

        self.apply_callback(txn, &response)
    }

    /// Transition a pending browser transaction to the callback's outcome.
    pub(crate) fn apply_callback(
        &self,
        txn: Transaction,
        response: &GatewayResponse,
    ) -> Result<CallbackAck> {
        let status = match response.outcome {
            Outcome::Approved => txn.transaction_type.approved_status(),
            Outcome::Declined => TransactionStatus::Declined,
            Outcome::ValidationRejected => TransactionStatus::Failed,
        };

        let saved_card = self.card_from_callback(&txn, response);
        let payment_method = match (&saved_card, &response.financial_token) {
            (Some(card), _) => Some(PaymentMethodRef::saved(card.id)),
            (None, Some(token)) => Some(PaymentMethodRef::one_time(GatewayToken::Financial(
                token.clone(),
            ))),
            (None, None) => None,
        };
        let update = TransactionUpdate {
            status,
            gateway: response.to_result(),
            payment_method,
        };

        let resolved = match self.store.transition_transaction(
            &txn.id,
            &[TransactionStatus::Pending, TransactionStatus::Ambiguous],
            &update,
        ) {
            Ok(resolved) => resolved,
            Err(StoreError::StatusConflict { .. }) => {
                let current = self
                    .store
                    .get_transaction(&txn.id)?
                    .ok_or_else(|| PaymentError::not_found("transaction", txn.id))?;
                tracing::info!(transaction_id = %txn.id, status = ?current.status, "Callback raced another resolution");
                return Ok(CallbackAck::for_transaction(CallbackOutcome::Duplicate, &current));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(card) = saved_card {
            match self.store.put_payment_method(&card) {
                Ok(()) => tracing::info!(
                    payment_method_id = %card.id,
                    customer_id = %card.customer_id,
                    "Saved card from browser payment"
                ),
                Err(e) => tracing::error!(
                    payment_method_id = %card.id,
                    transaction_id = %resolved.id,
                    error = %e,
                    "Failed to save tokenized card"
                ),
            }
        }

        tracing::info!(
            transaction_id = %resolved.id,
            status = ?resolved.status,
            response_code = %response.response_code,
            "Browser payment resolved"
        );
        Ok(CallbackAck::for_transaction(CallbackOutcome::Resolved, &resolved))
    }

    fn card_from_callback(
        &self,
        txn: &Transaction,
        response: &GatewayResponse,
    ) -> Option<PaymentMethod> {
        let tokenize = txn.browser.as_ref().is_some_and(|b| b.tokenize);
        if !tokenize || !response.is_approved() {
            return None;
        }
        let (Some(storage_token), Some(customer_id)) = (&response.storage_token, txn.customer_id)
        else {
            tracing::warn!(transaction_id = %txn.id, "Tokenizing payment approved without a storage token");
            return None;
        };
        let now = Utc::now();
        Some(PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: txn.merchant_id,
            customer_id,
            method_type: PaymentMethodType::CreditCard,
            storage_token: storage_token.clone(),
            last_four: response.last_four.clone().unwrap_or_default(),
            card_brand: response.card_brand.clone(),
            ach_account_type: None,
            is_active: true,
            is_verified: true,
            created_at: now,
            updated_at: now,
        })
    }
}
