//! Bank accounts and the ACH pre-note verification tracker.
//!
//! Storing an account tokenizes it at the gateway, saves an unverified
//! payment method and sends a zero-value pre-note. The bank only reports
//! problems, and only days later, so verification stays `Pending` until
//! [`PaymentEngine::reconcile_ach`] runs after the turnaround window:
//! a returned pre-note fails the verification and deactivates the method,
//! anything else verifies it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use z_payments_core::{
    validate_metadata, AchAccountDetails, AchVerification, Currency, CustomerId, GatewayResult,
    GatewayToken, IdempotencyKey, LedgerResult, MerchantId, Metadata, PaymentError,
    PaymentMethod, PaymentMethodId, PaymentMethodRef, PaymentMethodType, Processed,
    RequestFingerprint, Result, Transaction, TransactionNumber, TransactionStatus,
    TransactionType, VerificationStatus,
};
use z_payments_gateway::{DirectRequest, Funding, MerchantGateway, StatusResult, TranType};
use z_payments_store::{StoreError, TransactionUpdate};

use crate::collaborators::{Caller, Scope};
use crate::config::chrono_duration;
use crate::engine::PaymentEngine;
use crate::ledger::{unexpected_entry, LedgerEntry};
use crate::transactions::{describe_metadata, Draft, Lookup, Prepared};

/// A bank account to tokenize, save and verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAchAccountRequest {
    /// Owning customer.
    pub customer_id: CustomerId,
    /// Raw account details; only the last four digits are kept.
    pub account: AchAccountDetails,
    /// Metadata for the pre-note transaction.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A bank account to verify without saving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAchAccountRequest {
    /// Customer, if known.
    #[serde(default)]
    pub customer_id: Option<CustomerId>,
    /// Raw account details.
    pub account: AchAccountDetails,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A saved bank account and its verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAchAccount {
    /// The saved method; unverified until the pre-note clears.
    pub payment_method: PaymentMethod,
    /// Its pre-note verification.
    pub verification: AchVerification,
}

impl LedgerEntry for StoredAchAccount {
    fn ledger_result(&self) -> LedgerResult {
        LedgerResult::PaymentMethod(self.payment_method.id)
    }
}

/// Outcome of an ACH tracker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchReconcileReport {
    /// Verifications past the turnaround window.
    pub examined: usize,
    /// Newly verified.
    pub verified: usize,
    /// Newly failed; their methods were deactivated.
    pub failed: usize,
    /// Pre-notes with no verdict yet (resubmitted or still unanswered).
    pub still_pending: usize,
    /// Verifications left untouched because the gateway could not be queried.
    pub errors: usize,
}

/// Verdict on a pre-note.
pub(crate) enum PrenoteOutcome {
    /// No return: the account is good.
    Verified(Transaction),
    /// The bank returned the pre-note, or it was never processed.
    Returned(Transaction, Option<String>),
    /// No verdict yet.
    Unanswered(Transaction),
}

impl PrenoteOutcome {
    fn transaction(self) -> Transaction {
        match self {
            Self::Verified(txn) | Self::Returned(txn, _) | Self::Unanswered(txn) => txn,
        }
    }

    /// Verdict of a pre-note already resolved locally.
    fn of_resolved(txn: Transaction) -> Self {
        if txn.status == TransactionStatus::Captured {
            Self::Verified(txn)
        } else {
            let code = txn.gateway_response_code.clone();
            Self::Returned(txn, code)
        }
    }
}

/// A pre-note the gateway has not answered: never sent, or sent without a
/// reply. An accepted pre-note stays `Pending` but carries a response code.
fn is_unanswered_prenote(txn: &Transaction) -> bool {
    txn.status == TransactionStatus::Ambiguous
        || (txn.status == TransactionStatus::Pending && txn.gateway_response_code.is_none())
}

fn prenote_key(key: &IdempotencyKey) -> Result<IdempotencyKey> {
    IdempotencyKey::new(format!("{key}#prenote"))
}

impl PaymentEngine {
    /// Tokenize and save a bank account, then send its pre-note.
    ///
    /// The method, its pre-note and its verification are saved together, even
    /// if the pre-note then gets no answer; the tracker resolves it later. A
    /// retry with the same key sends a pre-note that was saved but never
    /// answered.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad routing or account numbers.
    /// - `Declined` if the gateway refuses to tokenize the account.
    /// - `GatewayUnavailable` if tokenization gets no answer; nothing is saved.
    pub async fn store_ach_account(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: StoreAchAccountRequest,
    ) -> Result<Processed<StoredAchAccount>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        request.account.validate()?;
        validate_metadata(&request.metadata)?;
        let prenote_key = prenote_key(key)?;

        let fingerprint = RequestFingerprint::builder("store_ach_account")
            .field("customer", request.customer_id)
            .field("routing", &request.account.routing_number)
            .field("account", &request.account.account_number)
            .field("account_type", format!("{:?}", request.account.account_type))
            .field("holder", &request.account.account_holder)
            .field("metadata", describe_metadata(&request.metadata))
            .finish();
        let merchant_id = caller.merchant_id;
        let fingerprint = &fingerprint;

        self.run_idempotent(
            &merchant_id,
            key,
            fingerprint,
            |result| async move {
                match result {
                    LedgerResult::PaymentMethod(id) => self.stored_ach_account(&merchant_id, &id),
                    other => Err(unexpected_entry(key, other)),
                }
            },
            || async move {
                let gateway = self.merchant_gateway(&merchant_id).await?;

                // A previous attempt stored the account; its pre-note may
                // still be unsent.
                if let Some(prenote) = self.store.find_transaction_by_key(&merchant_id, &prenote_key)? {
                    prenote.check_fingerprint(&fingerprint)?;
                    let Some(PaymentMethodRef::Saved { payment_method_id }) = prenote.payment_method.clone()
                    else {
                        return Err(PaymentError::IdempotencyConflict { key: key.to_string() });
                    };
                    if is_unanswered_prenote(&prenote) {
                        let method = self.load_payment_method(&merchant_id, &payment_method_id)?;
                        tracing::info!(
                            payment_method_id = %payment_method_id,
                            prenote_id = %prenote.id,
                            status = ?prenote.status,
                            "Resuming unanswered pre-note"
                        );
                        let prenote = match self.lookup(&gateway, prenote).await? {
                            Lookup::Resolved(prenote) => prenote,
                            Lookup::NotFound(prenote) => {
                                self.resend_prenote(&gateway, &method, prenote).await?
                            }
                        };
                        self.fail_rejected_prenote(&method, &prenote)?;
                    }
                    return self
                        .stored_ach_account(&merchant_id, &payment_method_id)
                        .map(Processed::replayed);
                }

                let method = self
                    .tokenize_account(&gateway, &merchant_id, key, &request)
                    .await?;

                let mut prenote = Draft {
                    transaction_type: TransactionType::Verification,
                    payment_method_type: PaymentMethodType::Ach,
                    amount_minor: 0,
                    currency: Currency::default(),
                    customer_id: Some(method.customer_id),
                    payment_method: Some(PaymentMethodRef::saved(method.id)),
                    parent_transaction_id: None,
                    browser: None,
                    metadata: request.metadata,
                }
                .into_transaction(merchant_id, prenote_key.as_str(), &fingerprint);
                let verification = AchVerification::pending(method.id, merchant_id, prenote.id);
                self.store
                    .insert_ach_account(&method, &mut prenote, &verification)?;

                let funding = Funding::Token(GatewayToken::Storage(method.storage_token.clone()));
                let prenote = self.submit_prenote(&gateway, prenote, &funding).await?;
                self.fail_rejected_prenote(&method, &prenote)?;

                tracing::info!(
                    payment_method_id = %method.id,
                    customer_id = %method.customer_id,
                    prenote_id = %prenote.id,
                    "Bank account stored"
                );
                self.stored_ach_account(&merchant_id, &method.id)
                    .map(Processed::fresh)
            },
        )
        .await
    }

    /// Send a pre-note for raw account details without saving them.
    ///
    /// The returned `Verification` transaction stays `Pending` when the
    /// gateway accepts the pre-note, and settles once the turnaround window
    /// passes.
    ///
    /// # Errors
    ///
    /// As for [`PaymentEngine::authorize`].
    pub async fn verify_ach_account(
        &self,
        caller: &Caller,
        key: &IdempotencyKey,
        request: VerifyAchAccountRequest,
    ) -> Result<Processed<Transaction>> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        request.account.validate()?;
        validate_metadata(&request.metadata)?;

        let fingerprint = RequestFingerprint::builder("verify_ach_account")
            .opt_field("customer", request.customer_id)
            .field("routing", &request.account.routing_number)
            .field("account", &request.account.account_number)
            .field("account_type", format!("{:?}", request.account.account_type))
            .field("holder", &request.account.account_holder)
            .field("metadata", describe_metadata(&request.metadata))
            .finish();
        let merchant_id = caller.merchant_id;

        self.execute(merchant_id, key, &fingerprint, TransactionType::Verification, || {
            let txn = Draft {
                transaction_type: TransactionType::Verification,
                payment_method_type: PaymentMethodType::Ach,
                amount_minor: 0,
                currency: Currency::default(),
                customer_id: request.customer_id,
                payment_method: None,
                parent_transaction_id: None,
                browser: None,
                metadata: request.metadata,
            }
            .into_transaction(merchant_id, key.as_str(), &fingerprint);
            Ok(Prepared {
                txn,
                funding: Funding::BankAccount(request.account),
                limit: None,
            })
        })
        .await
    }

    /// Verification record of a saved bank account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown methods and methods without one.
    pub async fn get_ach_verification(
        &self,
        caller: &Caller,
        payment_method_id: &PaymentMethodId,
    ) -> Result<AchVerification> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        self.load_payment_method(&caller.merchant_id, payment_method_id)?;
        self.store
            .get_ach_verification(payment_method_id)?
            .ok_or_else(|| PaymentError::not_found("ACH verification", payment_method_id))
    }

    /// Get one of the caller's payment methods.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and other merchants' methods.
    pub async fn get_payment_method(
        &self,
        caller: &Caller,
        id: &PaymentMethodId,
    ) -> Result<PaymentMethod> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        self.load_payment_method(&caller.merchant_id, id)
    }

    /// List a customer's payment methods, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store fails.
    pub async fn list_payment_methods(
        &self,
        caller: &Caller,
        customer_id: &CustomerId,
    ) -> Result<Vec<PaymentMethod>> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        Ok(self
            .store
            .list_payment_methods(&caller.merchant_id, customer_id)?)
    }

    /// Deactivate a payment method so it can no longer fund charges.
    ///
    /// Deactivating an inactive method is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and other merchants' methods.
    pub async fn deactivate_payment_method(
        &self,
        caller: &Caller,
        id: &PaymentMethodId,
    ) -> Result<PaymentMethod> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        let mut method = self.load_payment_method(&caller.merchant_id, id)?;
        if !method.is_active {
            return Ok(method);
        }
        method.is_active = false;
        method.updated_at = Utc::now();
        self.store.put_payment_method(&method)?;
        tracing::info!(payment_method_id = %id, merchant_id = %caller.merchant_id, "Payment method deactivated");
        Ok(method)
    }

    /// Resolve pending verifications older than the turnaround window.
    ///
    /// Invoked by an external scheduler.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only if the pending list cannot be read.
    pub async fn reconcile_ach(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<AchReconcileReport> {
        let cutoff = as_of - chrono_duration(self.config.ach_turnaround);
        let pending = self.store.list_pending_ach_verifications(cutoff, limit)?;
        let mut report = AchReconcileReport::default();

        for verification in pending {
            report.examined += 1;
            match self.reconcile_verification(&verification).await {
                Ok(VerificationStatus::Verified) => report.verified += 1,
                Ok(VerificationStatus::Failed) => report.failed += 1,
                Ok(VerificationStatus::Pending) => report.still_pending += 1,
                Err(e) => {
                    tracing::warn!(
                        payment_method_id = %verification.payment_method_id,
                        error = %e,
                        "ACH verification check failed"
                    );
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            verified = report.verified,
            failed = report.failed,
            errors = report.errors,
            "ACH reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_verification(
        &self,
        verification: &AchVerification,
    ) -> Result<VerificationStatus> {
        let txn = self
            .store
            .get_transaction(&verification.transaction_id)?
            .ok_or_else(|| PaymentError::not_found("transaction", verification.transaction_id))?;

        let outcome = if txn.status.is_unresolved() {
            let gateway = self.merchant_gateway(&verification.merchant_id).await?;
            self.settle_prenote(&gateway, txn).await?
        } else {
            PrenoteOutcome::of_resolved(txn)
        };

        match outcome {
            PrenoteOutcome::Verified(_) => self
                .resolve_verification(&verification.payment_method_id, VerificationStatus::Verified, None),
            PrenoteOutcome::Returned(_, code) => self.resolve_verification(
                &verification.payment_method_id,
                VerificationStatus::Failed,
                code.as_deref(),
            ),
            PrenoteOutcome::Unanswered(_) => Ok(VerificationStatus::Pending),
        }
    }

    fn resolve_verification(
        &self,
        payment_method_id: &PaymentMethodId,
        status: VerificationStatus,
        return_code: Option<&str>,
    ) -> Result<VerificationStatus> {
        match self
            .store
            .resolve_ach_verification(payment_method_id, status, return_code)
        {
            Ok(resolved) => {
                tracing::info!(
                    payment_method_id = %payment_method_id,
                    status = ?resolved.status,
                    return_code = ?resolved.return_code,
                    "ACH verification resolved"
                );
                Ok(resolved.status)
            }
            Err(StoreError::VerificationConflict { .. }) => Ok(self
                .store
                .get_ach_verification(payment_method_id)?
                .map_or(status, |v| v.status)),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the gateway how a pre-note ended and settle its transaction:
    /// `Captured` when no return arrived, `Declined` with the return code
    /// when the bank returned it. A pre-note the gateway never saw is
    /// resubmitted under its original number.
    pub(crate) async fn settle_prenote(
        &self,
        gateway: &MerchantGateway<'_>,
        txn: Transaction,
    ) -> Result<PrenoteOutcome> {
        let status = gateway
            .query_status(&txn.transaction_number)
            .await
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;

        let (response, return_code) = match status {
            StatusResult::Found {
                response,
                return_code,
            } => (response, return_code),
            StatusResult::NotFound => {
                let Some(funding) = self.funding_for(&txn)? else {
                    let failed = self.fail_unsubmitted(&txn)?;
                    return Ok(PrenoteOutcome::Returned(failed, None));
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
                tracing::info!(transaction_id = %txn.id, "Pre-note unknown to gateway, resubmitting");
                let txn = self.submit_prenote(gateway, txn, &funding).await?;
                return Ok(match txn.status {
                    TransactionStatus::Declined | TransactionStatus::Failed => {
                        PrenoteOutcome::of_resolved(txn)
                    }
                    _ => PrenoteOutcome::Unanswered(txn),
                });
            }
        };

        let returned = return_code.is_some() || !response.is_approved();
        let (status, gateway_result) = if returned {
            let code = return_code.or_else(|| Some(response.response_code.clone()));
            (
                TransactionStatus::Declined,
                GatewayResult {
                    response_code: code,
                    ..response.to_result()
                },
            )
        } else {
            (TransactionStatus::Captured, response.to_result())
        };

        let settled = match self.store.transition_transaction(
            &txn.id,
            &[TransactionStatus::Pending, TransactionStatus::Ambiguous],
            &TransactionUpdate::with_gateway(status, gateway_result),
        ) {
            Ok(settled) => settled,
            Err(StoreError::StatusConflict { current, .. }) if !current.is_unresolved() => self
                .store
                .get_transaction(&txn.id)?
                .ok_or_else(|| PaymentError::not_found("transaction", txn.id))?,
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(transaction_id = %settled.id, status = ?settled.status, "Pre-note settled");
        Ok(PrenoteOutcome::of_resolved(settled))
    }

    /// Fail the verification of a pre-note the gateway refused outright.
    fn fail_rejected_prenote(&self, method: &PaymentMethod, prenote: &Transaction) -> Result<()> {
        if matches!(prenote.status, TransactionStatus::Declined | TransactionStatus::Failed) {
            tracing::info!(
                payment_method_id = %method.id,
                response_code = ?prenote.gateway_response_code,
                "Pre-note rejected at submission"
            );
            self.resolve_verification(
                &method.id,
                VerificationStatus::Failed,
                prenote.gateway_response_code.as_deref(),
            )?;
        }
        Ok(())
    }

    /// Resubmit a pre-note the gateway has no record of.
    async fn resend_prenote(
        &self,
        gateway: &MerchantGateway<'_>,
        method: &PaymentMethod,
        prenote: Transaction,
    ) -> Result<Transaction> {
        let prenote = if prenote.status == TransactionStatus::Ambiguous {
            self.store.transition_transaction(
                &prenote.id,
                &[TransactionStatus::Ambiguous],
                &TransactionUpdate::status(TransactionStatus::Pending),
            )?
        } else {
            prenote
        };
        let funding = Funding::Token(GatewayToken::Storage(method.storage_token.clone()));
        self.submit_prenote(gateway, prenote, &funding).await
    }

    /// Settle a raw-account pre-note whose turnaround window has passed.
    pub(crate) async fn settle_verification_transaction(
        &self,
        gateway: &MerchantGateway<'_>,
        txn: Transaction,
    ) -> Result<Transaction> {
        self.settle_prenote(gateway, txn)
            .await
            .map(PrenoteOutcome::transaction)
    }

    /// Submit a pre-note. Unlike charges, a failed submission keeps the
    /// record (as `Ambiguous`) because a verification already refers to it.
    async fn submit_prenote(
        &self,
        gateway: &MerchantGateway<'_>,
        txn: Transaction,
        funding: &Funding,
    ) -> Result<Transaction> {
        let request = DirectRequest {
            tran_type: TranType::AchPrenote,
            transaction_number: txn.transaction_number.clone(),
            amount_minor: 0,
            funding: funding.clone(),
        };
        match gateway.submit(&request).await {
            Ok(response) => self.record_response(&txn, &response),
            Err(e) => {
                tracing::warn!(transaction_id = %txn.id, error = %e, "Pre-note got no answer, leaving it ambiguous");
                self.mark_ambiguous(&txn);
                Ok(self.store.get_transaction(&txn.id)?.unwrap_or(txn))
            }
        }
    }

    /// Exchange raw account details for a storage token.
    async fn tokenize_account(
        &self,
        gateway: &MerchantGateway<'_>,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        request: &StoreAchAccountRequest,
    ) -> Result<PaymentMethod> {
        let storage = DirectRequest {
            tran_type: TranType::AchStorage,
            transaction_number: TransactionNumber::derive(merchant_id, &format!("{key}:storage")),
            amount_minor: 0,
            funding: Funding::BankAccount(request.account.clone()),
        };
        let response = gateway.submit(&storage).await.map_err(|e| {
            tracing::warn!(merchant_id = %merchant_id, error = %e, "Bank account tokenization failed");
            PaymentError::from(e)
        })?;

        if !response.is_approved() {
            return Err(PaymentError::Declined {
                code: response.response_code,
                message: response.response_message,
            });
        }
        let storage_token = response.storage_token.ok_or_else(|| {
            PaymentError::GatewayUnavailable("tokenization returned no storage token".into())
        })?;

        let now = Utc::now();
        Ok(PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: *merchant_id,
            customer_id: request.customer_id,
            method_type: PaymentMethodType::Ach,
            storage_token,
            last_four: request.account.last_four(),
            card_brand: None,
            ach_account_type: Some(request.account.account_type),
            is_active: true,
            is_verified: false,
            created_at: now,
            updated_at: now,
        })
    }

    fn stored_ach_account(
        &self,
        merchant_id: &MerchantId,
        id: &PaymentMethodId,
    ) -> Result<StoredAchAccount> {
        let payment_method = self.load_payment_method(merchant_id, id)?;
        let verification = self
            .store
            .get_ach_verification(id)?
            .ok_or_else(|| PaymentError::not_found("ACH verification", id))?;
        Ok(StoredAchAccount {
            payment_method,
            verification,
        })
    }
}
