//! Reconciliation of transactions whose gateway outcome is unknown.
//!
//! A transaction is left `Ambiguous` when the request went out but no usable
//! answer came back, and stays `Pending` when a browser never completed its
//! submission or a holder crashed mid-call. Reconciliation asks the gateway
//! by transaction number: a found transaction takes the gateway's outcome, a
//! missing one is marked `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use z_payments_core::{
    PaymentError, Result, Transaction, TransactionId, TransactionStatus, TransactionType,
};
use z_payments_gateway::StatusResult;

use crate::collaborators::{Caller, Scope};
use crate::config::chrono_duration;
use crate::engine::PaymentEngine;
use crate::transactions::Lookup;

/// Outcome of a reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    /// Transactions queried at the gateway.
    pub examined: usize,
    /// Resolved to the gateway's outcome.
    pub resolved: usize,
    /// Marked `Failed` because the gateway never saw them.
    pub failed: usize,
    /// Still unresolved after the query.
    pub still_unresolved: usize,
    /// Queries that failed; those records are untouched.
    pub errors: usize,
    /// Expired idempotency records removed.
    pub purged: usize,
}

impl PaymentEngine {
    /// Reconcile one of the caller's transactions now.
    ///
    /// Resolved transactions are returned unchanged, as are pre-notes of
    /// saved bank accounts, which only the ACH tracker settles.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown ids.
    /// - `GatewayUnavailable` if the status query fails.
    pub async fn reconcile_transaction(
        &self,
        caller: &Caller,
        id: &TransactionId,
    ) -> Result<Transaction> {
        self.check_scope(caller, Scope::PaymentsWrite).await?;
        let txn = self.load_transaction(&caller.merchant_id, id)?;
        let tracked_prenote = txn.transaction_type == TransactionType::Verification
            && txn.payment_method.is_some();
        if !txn.status.is_unresolved() || tracked_prenote {
            return Ok(txn);
        }
        self.reconcile_one(txn).await
    }

    /// Reconcile unresolved transactions last touched before `as_of`, then
    /// purge expired idempotency records.
    ///
    /// Invoked by an external scheduler. One transaction's failure never
    /// aborts the sweep.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only if the candidate list cannot be read.
    pub async fn reconcile_ambiguous(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReconcileSummary> {
        let candidates = self.store.list_unresolved_transactions(as_of, limit)?;
        let mut summary = ReconcileSummary::default();

        for txn in candidates {
            if !self.is_due_for_reconciliation(&txn, as_of) {
                continue;
            }
            summary.examined += 1;
            let id = txn.id;

            match self.reconcile_one(txn).await {
                Ok(t) if t.status == TransactionStatus::Failed => summary.failed += 1,
                Ok(t) if t.status.is_unresolved() => summary.still_unresolved += 1,
                Ok(_) => summary.resolved += 1,
                Err(e) => {
                    tracing::warn!(transaction_id = %id, error = %e, "Reconciliation failed");
                    summary.errors += 1;
                }
            }
        }

        summary.purged = match self.purge_idempotency_ledger() {
            Ok(purged) => purged,
            Err(e) => {
                tracing::error!(error = %e, "Idempotency purge failed");
                0
            }
        };

        tracing::info!(
            examined = summary.examined,
            resolved = summary.resolved,
            failed = summary.failed,
            errors = summary.errors,
            "Reconciliation sweep finished"
        );
        Ok(summary)
    }

    /// Whether an unresolved record should be queried now.
    fn is_due_for_reconciliation(&self, txn: &Transaction, as_of: DateTime<Utc>) -> bool {
        let is_prenote = txn.transaction_type == TransactionType::Verification;
        match (txn.status, &txn.browser) {
            // Pre-notes of saved accounts belong to the ACH tracker.
            _ if is_prenote && txn.payment_method.is_some() => false,
            (TransactionStatus::Ambiguous, _) => true,
            (_, Some(browser)) => {
                browser.expires_at + chrono_duration(self.config.pending_callback_grace) <= as_of
            }
            _ if is_prenote && txn.gateway_response_code.is_some() => {
                txn.created_at + chrono_duration(self.config.ach_turnaround) <= as_of
            }
            _ => txn.updated_at + chrono_duration(self.config.stale_pending_after) <= as_of,
        }
    }

    async fn reconcile_one(&self, txn: Transaction) -> Result<Transaction> {
        let gateway = self.merchant_gateway(&txn.merchant_id).await?;
        tracing::debug!(transaction_id = %txn.id, status = ?txn.status, "Reconciling transaction");

        if txn.browser.is_some() {
            let status = gateway
                .query_status(&txn.transaction_number)
                .await
                .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
            return match status {
                StatusResult::Found { response, .. } => {
                    self.apply_callback(txn.clone(), &response)?;
                    self.load_transaction(&txn.merchant_id, &txn.id)
                }
                StatusResult::NotFound => self.fail_unsubmitted(&txn),
            };
        }

        // An accepted pre-note waits for a return, not for an answer.
        if txn.transaction_type == TransactionType::Verification
            && txn.gateway_response_code.is_some()
        {
            return self.settle_verification_transaction(&gateway, txn).await;
        }

        match self.lookup(&gateway, txn).await? {
            Lookup::Resolved(txn) => Ok(txn),
            Lookup::NotFound(txn) => self.fail_unsubmitted(&txn),
        }
    }
}
