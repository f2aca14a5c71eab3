//! Transaction operations and the submission path they share.
//!
//! Every mutating operation runs under the idempotency ledger. Inside the
//! reservation the engine first looks for a record already created under the
//! same key: a resolved one is returned as is, an unresolved one (a previous
//! attempt timed out or crashed) is settled through a status query and, if
//! the gateway never saw it, resubmitted under its original transaction
//! number. Only when no record exists is a new `Pending` record inserted and
//! submitted.
//!
//! Gateway adapter errors split two ways:
//!
//! - the gateway was never reached: the `Pending` record is deleted and the
//!   key released, so the call is retried as if it never happened;
//! - the request may have been processed: the record is left `Ambiguous`
//!   for reconciliation and the caller gets `GatewayTimeout`.

use serde::{Deserialize, Serialize};

use z_payments_core::{
    validate_amount, validate_metadata, BrowserContext, CustomerId, Currency, GatewayToken,
    IdempotencyKey, LedgerResult, MerchantId, Metadata, PaymentError, PaymentMethodRef,
    PaymentMethodType, Processed, RequestFingerprint, Result, Transaction, TransactionFilter,
    TransactionId, TransactionNumber, TransactionStatus, TransactionType,
};
use z_payments_gateway::{
    DirectRequest, Funding, GatewayResponse, MerchantGateway, Outcome, StatusResult, TranType,
};
use z_payments_store::{StoreError, TransactionUpdate};

use chrono::Utc;

use crate::collaborators::{Caller, Scope};
use crate::engine::PaymentEngine;
use crate::ledger::{unexpected_entry, LedgerEntry};

/// Largest page `list_transactions` returns.
pub const MAX_PAGE_SIZE: usize = 100;

// ============================================================================
// Requests
// ============================================================================

/// A new charge: authorization, sale or ACH debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Customer being charged. Taken from the payment method when saved.
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Currency (default USD).
    #[serde(default)]
    pub currency: Currency,
    /// Saved method or one-time token.
    pub payment_method: PaymentMethodRef,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A capture or refund against a parent transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowUpRequest {
    /// Amount in minor units; the whole remaining amount when absent.
    #[serde(default)]
    pub amount_minor: Option<i64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// An ACH credit: a linked refund of an ACH debit, or a standalone credit to
/// a saved bank account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AchCreditRequest {
    /// ACH debit being refunded.
    #[serde(default)]
    pub parent_transaction_id: Option<TransactionId>,
    /// Saved bank account for a standalone credit.
    #[serde(default)]
    pub payment_method: Option<PaymentMethodRef>,
    /// Customer, for standalone credits.
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    /// Amount; required for standalone credits.
    #[serde(default)]
    pub amount_minor: Option<i64>,
    /// Currency (default USD).
    #[serde(default)]
    pub currency: Currency,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

// ============================================================================
// Internal plumbing
// ============================================================================

/// The fields of a transaction about to be created.
pub(crate) struct Draft {
    pub transaction_type: TransactionType,
    pub payment_method_type: PaymentMethodType,
    pub amount_minor: i64,
    pub currency: Currency,
    pub customer_id: Option<CustomerId>,
    pub payment_method: Option<PaymentMethodRef>,
    pub parent_transaction_id: Option<TransactionId>,
    pub browser: Option<BrowserContext>,
    pub metadata: Metadata,
}

impl Draft {
    pub(crate) fn into_transaction(
        self,
        merchant_id: MerchantId,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TransactionId::generate(),
            merchant_id,
            customer_id: self.customer_id,
            amount_minor: self.amount_minor,
            currency: self.currency,
            status: TransactionStatus::Pending,
            transaction_type: self.transaction_type,
            payment_method_type: self.payment_method_type,
            payment_method: self.payment_method,
            transaction_number: TransactionNumber::derive(&merchant_id, key),
            gateway_transaction_id: None,
            gateway_response_code: None,
            gateway_response_message: None,
            gateway_auth_code: None,
            idempotency_key: key.to_string(),
            request_fingerprint: fingerprint.clone(),
            parent_transaction_id: self.parent_transaction_id,
            browser: self.browser,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A transaction ready to be stored and submitted.
pub(crate) struct Prepared {
    pub txn: Transaction,
    pub funding: Funding,
    /// Parent amount bounding same-type siblings, for child records.
    pub limit: Option<i64>,
}

/// Result of asking the gateway about an unresolved record.
pub(crate) enum Lookup {
    /// The gateway knew the transaction; the record now carries its outcome.
    Resolved(Transaction),
    /// The gateway has no transaction under this number.
    NotFound(Transaction),
}

impl LedgerEntry for Transaction {
    fn ledger_result(&self) -> LedgerResult {
        LedgerResult::Transaction(self.id)
    }
}

/// Stable textual form of a funding reference for fingerprints.
pub(crate) fn describe_method(reference: &PaymentMethodRef) -> String {
    match reference {
        PaymentMethodRef::Saved { payment_method_id } => format!("saved:{payment_method_id}"),
        PaymentMethodRef::OneTime { token } => match token {
            GatewayToken::Financial(v) => format!("financial:{v}"),
            GatewayToken::Storage(v) => format!("storage:{v}"),
        },
    }
}

pub(crate) fn describe_metadata(metadata: &Metadata) -> String {
    serde_json::to_string(metadata).unwrap_or_default()
}

const fn status_for(outcome: Outcome, transaction_type: TransactionType) -> TransactionStatus {
    match outcome {
        Outcome::Approved => transaction_type.approved_status(),
        Outcome::Declined => TransactionStatus::Declined,
        Outcome::ValidationRejected => TransactionStatus::Failed,
    }
}

impl PaymentEngine {
    // =========================================================================
    // Card operations
    // =========================================================================

    /// Hold funds on a card.
    ///
    /// A decline is not an error: the returned transaction is `Declined`.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad amounts, metadata or payment methods.
    /// - `IdempotencyConflict` / `RequestInProgress` from the ledger.
    /// - `GatewayUnavailable` (nothing recorded) or `GatewayTimeout` (record
    ///   left ambiguous).
    pub async fn authorize(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: ChargeRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        self.charge(
            caller.merchant_id,
            key,
            TransactionType::Authorization,
            PaymentMethodType::CreditCard,
            request,
        )
        .await
    }

    /// Authorize and capture a card charge in one step.
    ///
    /// # Errors
    ///
    /// See [`PaymentEngine::authorize`].
    pub async fn sale(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: ChargeRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        self.charge(
            caller.merchant_id,
            key,
            TransactionType::Sale,
            PaymentMethodType::CreditCard,
            request,
        )
        .await
    }

    /// Settle an authorization, fully or partially.
    ///
    /// # Errors
    ///
    /// - `StateConflict` if the parent is not `Authorized` or the amount
    ///   exceeds what is left to capture.
    /// - Otherwise as for [`PaymentEngine::authorize`].
    pub async fn capture(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        parent_id: &TransactionId,
        request: FollowUpRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        self.follow_up(caller.merchant_id, key, TransactionType::Capture, None, parent_id, request)
            .await
    }

    /// Cancel an authorization or an unsettled capture/sale.
    ///
    /// # Errors
    ///
    /// - `StateConflict` if the parent is not voidable or already has
    ///   captures, refunds or a void in flight or approved.
    /// - Otherwise as for [`PaymentEngine::authorize`].
    pub async fn void(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        parent_id: &TransactionId,
        metadata: Metadata,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        let request = FollowUpRequest {
            amount_minor: None,
            metadata,
        };
        self.follow_up(caller.merchant_id, key, TransactionType::Void, None, parent_id, request)
            .await
    }

    /// Return settled funds, fully or partially.
    ///
    /// # Errors
    ///
    /// - `StateConflict` if the parent is not `Captured` or the amount
    ///   exceeds what is left to refund.
    /// - Otherwise as for [`PaymentEngine::authorize`].
    pub async fn refund(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        parent_id: &TransactionId,
        request: FollowUpRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        self.follow_up(caller.merchant_id, key, TransactionType::Refund, None, parent_id, request)
            .await
    }

    // =========================================================================
    // ACH operations
    // =========================================================================

    /// Debit a bank account (a sale over ACH).
    ///
    /// # Errors
    ///
    /// - `StateConflict` if the saved account is not verified and
    ///   verification is required.
    /// - Otherwise as for [`PaymentEngine::authorize`].
    pub async fn ach_debit(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: ChargeRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        self.charge(
            caller.merchant_id,
            key,
            TransactionType::Sale,
            PaymentMethodType::Ach,
            request,
        )
        .await
    }

    /// Credit a bank account: a linked refund of an ACH debit when a parent
    /// is given, otherwise a standalone credit to a saved bank account.
    ///
    /// # Errors
    ///
    /// - `Validation` when neither a parent nor a saved method (with an
    ///   amount) is given, or the parent is not an ACH transaction.
    /// - Otherwise as for [`PaymentEngine::refund`].
    pub async fn ach_credit(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: AchCreditRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;

        if let Some(parent_id) = request.parent_transaction_id {
            if request.payment_method.is_some() {
                return Err(PaymentError::Validation(
                    "a linked ACH credit takes its account from the parent".into(),
                ));
            }
            let follow_up = FollowUpRequest {
                amount_minor: request.amount_minor,
                metadata: request.metadata,
            };
            return self
                .follow_up(
                    caller.merchant_id,
                    key,
                    TransactionType::Refund,
                    Some(PaymentMethodType::Ach),
                    &parent_id,
                    follow_up,
                )
                .await;
        }

        let (Some(payment_method), Some(amount_minor)) =
            (request.payment_method, request.amount_minor)
        else {
            return Err(PaymentError::Validation(
                "a standalone ACH credit needs a payment method and an amount".into(),
            ));
        };
        let charge = ChargeRequest {
            customer_id: request.customer_id,
            amount_minor,
            currency: request.currency,
            payment_method,
            metadata: request.metadata,
        };
        self.charge(
            caller.merchant_id,
            key,
            TransactionType::Refund,
            PaymentMethodType::Ach,
            charge,
        )
        .await
    }

    /// Void an ACH debit or credit before it settles.
    ///
    /// # Errors
    ///
    /// - `Validation` if the parent is not an ACH transaction.
    /// - Otherwise as for [`PaymentEngine::void`].
    pub async fn ach_void(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        parent_id: &TransactionId,
        metadata: Metadata,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        let request = FollowUpRequest {
            amount_minor: None,
            metadata,
        };
        self.follow_up(
            caller.merchant_id,
            key,
            TransactionType::Void,
            Some(PaymentMethodType::Ach),
            parent_id,
            request,
        )
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get one of the caller's transactions.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and other merchants' records.
    pub async fn get_transaction(&self, caller: &Caller, id: &TransactionId) -> Result<Transaction> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        self.load_transaction(&caller.merchant_id, id)
    }

    /// List the caller's transactions, newest first. `limit` is capped at
    /// [`MAX_PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn list_transactions(
        &self,
        caller: &Caller,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self
            .store
            .list_transactions(&caller.merchant_id, filter, limit, offset)?)
    }

    // =========================================================================
    // Shared paths
    // =========================================================================

    /// A new root charge over `family` (card or ACH).
    pub(crate) async fn charge(
        &self,
        merchant_id: MerchantId,
        key: &IdempotencyKey,
        transaction_type: TransactionType,
        family: PaymentMethodType,
        request: ChargeRequest,
    ) -> Result<Processed<Transaction>> {
        validate_amount(request.amount_minor)?;
        validate_metadata(&request.metadata)?;
        TranType::for_operation(transaction_type, family)?;

        let fingerprint = RequestFingerprint::builder(transaction_type.verb())
            .field("family", format!("{family:?}"))
            .field("amount", request.amount_minor)
            .field("currency", &request.currency)
            .opt_field("customer", request.customer_id)
            .field("payment_method", describe_method(&request.payment_method))
            .field("metadata", describe_metadata(&request.metadata))
            .finish();

        self.execute(merchant_id, key, &fingerprint, transaction_type, || {
            let (funding, customer_id) = self.resolve_funding(
                &merchant_id,
                family,
                transaction_type,
                request.customer_id,
                &request.payment_method,
            )?;
            let txn = Draft {
                transaction_type,
                payment_method_type: family,
                amount_minor: request.amount_minor,
                currency: request.currency,
                customer_id,
                payment_method: Some(request.payment_method),
                parent_transaction_id: None,
                browser: None,
                metadata: request.metadata,
            }
            .into_transaction(merchant_id, key.as_str(), &fingerprint);
            Ok(Prepared {
                txn,
                funding,
                limit: None,
            })
        })
        .await
    }

    /// A child operation against `parent_id`.
    async fn follow_up(
        &self,
        merchant_id: MerchantId,
        key: &IdempotencyKey,
        transaction_type: TransactionType,
        family: Option<PaymentMethodType>,
        parent_id: &TransactionId,
        request: FollowUpRequest,
    ) -> Result<Processed<Transaction>> {
        if let Some(amount) = request.amount_minor {
            validate_amount(amount)?;
        }
        validate_metadata(&request.metadata)?;

        let fingerprint = RequestFingerprint::builder(transaction_type.verb())
            .field("parent", parent_id)
            .opt_field("family", family.map(|f| format!("{f:?}")))
            .opt_field("amount", request.amount_minor)
            .field("metadata", describe_metadata(&request.metadata))
            .finish();

        self.execute(merchant_id, key, &fingerprint, transaction_type, || {
            self.prepare_child(
                &merchant_id,
                key,
                &fingerprint,
                transaction_type,
                family,
                parent_id,
                request,
            )
        })
        .await
    }

    /// Run one direct-mode transaction under the ledger.
    pub(crate) async fn execute<P>(
        &self,
        merchant_id: MerchantId,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        transaction_type: TransactionType,
        prepare: P,
    ) -> Result<Processed<Transaction>>
    where
        P: FnOnce() -> Result<Prepared>,
    {
        self.run_idempotent(
            &merchant_id,
            key,
            fingerprint,
            |result| async move {
                match result {
                    LedgerResult::Transaction(id) => self.load_transaction(&merchant_id, &id),
                    other => Err(unexpected_entry(key, other)),
                }
            },
            || async move {
                let gateway = self.merchant_gateway(&merchant_id).await?;

                if let Some(existing) = self.store.find_transaction_by_key(&merchant_id, key)? {
                    return self
                        .resume(&gateway, existing, fingerprint, transaction_type)
                        .await;
                }

                let mut prepared = prepare()?;
                match prepared.limit {
                    Some(limit) => self.store.insert_child_transaction(&mut prepared.txn, limit)?,
                    None => self.store.insert_transaction(&mut prepared.txn)?,
                }
                tracing::debug!(
                    transaction_id = %prepared.txn.id,
                    merchant_id = %merchant_id,
                    transaction_type = ?transaction_type,
                    amount_minor = prepared.txn.amount_minor,
                    "Recorded pending transaction"
                );

                self.submit_and_record(&gateway, prepared.txn, &prepared.funding)
                    .await
                    .map(Processed::fresh)
            },
        )
        .await
    }

    /// Settle a record left unresolved by an earlier attempt with the same key.
    async fn resume(
        &self,
        gateway: &MerchantGateway<'_>,
        existing: Transaction,
        fingerprint: &RequestFingerprint,
        transaction_type: TransactionType,
    ) -> Result<Processed<Transaction>> {
        if existing.transaction_type != transaction_type || existing.browser.is_some() {
            return Err(PaymentError::IdempotencyConflict {
                key: existing.idempotency_key,
            });
        }
        existing.check_fingerprint(fingerprint)?;
        if !existing.status.is_unresolved() {
            return Ok(Processed::replayed(existing));
        }

        tracing::info!(
            transaction_id = %existing.id,
            status = ?existing.status,
            "Resuming unresolved transaction"
        );

        match self.lookup(gateway, existing).await? {
            Lookup::Resolved(txn) => Ok(Processed::replayed(txn)),
            Lookup::NotFound(txn) => {
                let Some(funding) = self.funding_for(&txn)? else {
                    return self.fail_unsubmitted(&txn).map(Processed::fresh);
                };
                let txn = if txn.status == TransactionStatus::Ambiguous {
                    self.store.transition_transaction(
                        &txn.id,
                        &[TransactionStatus::Ambiguous],
                        &TransactionUpdate::status(TransactionStatus::Pending),
                    )?
                } else {
                    txn
                };
                tracing::info!(
                    transaction_id = %txn.id,
                    transaction_number = %txn.transaction_number,
                    "Gateway has no record, resubmitting"
                );
                self.submit_and_record(gateway, txn, &funding)
                    .await
                    .map(Processed::fresh)
            }
        }
    }

    /// Ask the gateway how an unresolved record ended.
    pub(crate) async fn lookup(
        &self,
        gateway: &MerchantGateway<'_>,
        txn: Transaction,
    ) -> Result<Lookup> {
        match gateway.query_status(&txn.transaction_number).await {
            Ok(StatusResult::Found { response, .. }) => {
                self.record_response(&txn, &response).map(Lookup::Resolved)
            }
            Ok(StatusResult::NotFound) => Ok(Lookup::NotFound(txn)),
            Err(e) => {
                tracing::warn!(transaction_id = %txn.id, error = %e, "Status query failed");
                Err(PaymentError::GatewayUnavailable(e.to_string()))
            }
        }
    }

    /// Mark a record the gateway never processed as `Failed`.
    pub(crate) fn fail_unsubmitted(&self, txn: &Transaction) -> Result<Transaction> {
        let update = TransactionUpdate::with_gateway(
            TransactionStatus::Failed,
            z_payments_core::GatewayResult {
                response_message: Some("not found at gateway".into()),
                ..Default::default()
            },
        );
        let failed = self.store.transition_transaction(
            &txn.id,
            &[TransactionStatus::Pending, TransactionStatus::Ambiguous],
            &update,
        )?;
        tracing::info!(transaction_id = %txn.id, "Unresolved transaction marked failed");
        Ok(failed)
    }

    /// Funding of an existing record, for resubmission.
    pub(crate) fn funding_for(&self, txn: &Transaction) -> Result<Option<Funding>> {
        if let Some(parent_id) = txn.parent_transaction_id {
            let parent = self
                .store
                .get_transaction(&parent_id)?
                .ok_or_else(|| PaymentError::not_found("transaction", parent_id))?;
            return Ok(parent.financial_token().map(Funding::Token));
        }
        match &txn.payment_method {
            Some(PaymentMethodRef::Saved { payment_method_id }) => Ok(self
                .store
                .get_payment_method(payment_method_id)?
                .map(|m| Funding::Token(GatewayToken::Storage(m.storage_token)))),
            Some(PaymentMethodRef::OneTime { token }) => Ok(Some(Funding::Token(token.clone()))),
            None => Ok(None),
        }
    }

    /// Submit a `Pending` record and store the classified outcome.
    pub(crate) async fn submit_and_record(
        &self,
        gateway: &MerchantGateway<'_>,
        txn: Transaction,
        funding: &Funding,
    ) -> Result<Transaction> {
        let tran_type = match TranType::for_operation(txn.transaction_type, txn.payment_method_type) {
            Ok(tran_type) => tran_type,
            Err(e) => {
                self.discard_pending(&txn);
                return Err(e.into());
            }
        };
        let request = DirectRequest {
            tran_type,
            transaction_number: txn.transaction_number.clone(),
            amount_minor: txn.amount_minor,
            funding: funding.clone(),
        };

        match gateway.submit(&request).await {
            Ok(response) => self.record_response(&txn, &response),
            Err(e) if e.is_ambiguous() => {
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %e,
                    "Gateway outcome unknown, leaving transaction ambiguous"
                );
                self.mark_ambiguous(&txn);
                Err(PaymentError::GatewayTimeout {
                    transaction_id: txn.id,
                })
            }
            Err(e) => {
                tracing::warn!(transaction_id = %txn.id, error = %e, "Gateway unreachable, discarding pending transaction");
                self.discard_pending(&txn);
                Err(e.into())
            }
        }
    }

    /// Apply a classified gateway answer to an unresolved record.
    pub(crate) fn record_response(
        &self,
        txn: &Transaction,
        response: &GatewayResponse,
    ) -> Result<Transaction> {
        let status = status_for(response.outcome, txn.transaction_type);
        let update = TransactionUpdate::with_gateway(status, response.to_result());

        let updated = match self.store.transition_transaction(
            &txn.id,
            &[TransactionStatus::Pending, TransactionStatus::Ambiguous],
            &update,
        ) {
            Ok(updated) => updated,
            Err(StoreError::StatusConflict { current, .. }) if !current.is_unresolved() => {
                tracing::debug!(transaction_id = %txn.id, status = ?current, "Transaction already resolved");
                return self
                    .store
                    .get_transaction(&txn.id)?
                    .ok_or_else(|| PaymentError::not_found("transaction", txn.id));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(approved) = response.approved_amount_minor {
            if response.is_approved() && approved != txn.amount_minor && txn.amount_minor > 0 {
                tracing::warn!(
                    transaction_id = %txn.id,
                    requested = txn.amount_minor,
                    approved,
                    "Gateway approved a different amount"
                );
            }
        }

        match response.outcome {
            Outcome::Approved => tracing::info!(
                transaction_id = %updated.id,
                status = ?updated.status,
                response_code = %response.response_code,
                "Transaction approved"
            ),
            Outcome::Declined | Outcome::ValidationRejected => tracing::info!(
                transaction_id = %updated.id,
                status = ?updated.status,
                response_code = %response.response_code,
                response_message = %response.response_message,
                "Transaction declined"
            ),
        }

        if updated.is_approved() {
            self.apply_parent_effects(&updated);
        }
        Ok(updated)
    }

    pub(crate) fn mark_ambiguous(&self, txn: &Transaction) {
        if let Err(e) = self.store.transition_transaction(
            &txn.id,
            &[TransactionStatus::Pending, TransactionStatus::Ambiguous],
            &TransactionUpdate::status(TransactionStatus::Ambiguous),
        ) {
            tracing::error!(transaction_id = %txn.id, error = %e, "Failed to mark transaction ambiguous");
        }
    }

    pub(crate) fn discard_pending(&self, txn: &Transaction) {
        if let Err(e) = self.store.delete_pending_transaction(&txn.id) {
            tracing::error!(transaction_id = %txn.id, error = %e, "Failed to discard pending transaction");
        }
    }

    /// Resolve a charge's funding and customer from its payment method.
    fn resolve_funding(
        &self,
        merchant_id: &MerchantId,
        family: PaymentMethodType,
        transaction_type: TransactionType,
        customer_id: Option<CustomerId>,
        reference: &PaymentMethodRef,
    ) -> Result<(Funding, Option<CustomerId>)> {
        match reference {
            PaymentMethodRef::OneTime { token } => Ok((Funding::Token(token.clone()), customer_id)),
            PaymentMethodRef::Saved { payment_method_id } => {
                let method = self.load_payment_method(merchant_id, payment_method_id)?;
                if method.method_type != family {
                    return Err(PaymentError::Validation(format!(
                        "payment method {payment_method_id} is not a {family:?} method"
                    )));
                }
                if customer_id.is_some_and(|c| c != method.customer_id) {
                    return Err(PaymentError::Validation(format!(
                        "payment method {payment_method_id} belongs to another customer"
                    )));
                }
                if !method.is_active {
                    return Err(PaymentError::StateConflict(format!(
                        "payment method {payment_method_id} is inactive"
                    )));
                }
                let debit = transaction_type != TransactionType::Refund;
                if debit && !method.is_chargeable(self.config.require_verified_ach) {
                    return Err(PaymentError::StateConflict(format!(
                        "bank account {payment_method_id} is not verified"
                    )));
                }
                Ok((
                    Funding::Token(GatewayToken::Storage(method.storage_token)),
                    Some(method.customer_id),
                ))
            }
        }
    }
}
