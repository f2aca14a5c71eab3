//! Parent/child linkage: the authorization -> capture -> refund/void chain.
//!
//! Cumulative amounts and void exclusion are checked here before insertion
//! for a precise error, and enforced again atomically by the store when the
//! child is inserted. A live void (anything but `Declined` or `Failed`,
//! including `Pending` and `Ambiguous`) blocks captures and refunds, and any
//! live child blocks a void.

use std::collections::VecDeque;

use z_payments_core::{
    IdempotencyKey, MerchantId, PaymentError, PaymentMethodType, RequestFingerprint, Result,
    Transaction, TransactionId, TransactionStatus, TransactionType,
};
use z_payments_gateway::{Funding, TranType};
use z_payments_store::TransactionUpdate;

use crate::collaborators::{Caller, Scope};
use crate::engine::PaymentEngine;
use crate::transactions::{Draft, FollowUpRequest, Prepared};

/// Amount a child of `transaction_type` may still take from `parent`.
///
/// Zero while a live void sits on the parent.
#[must_use]
pub fn remaining_amount(
    parent: &Transaction,
    siblings: &[Transaction],
    transaction_type: TransactionType,
) -> i64 {
    if live_void(siblings).is_some() {
        return 0;
    }
    let committed: i64 = siblings
        .iter()
        .filter(|s| s.transaction_type == transaction_type)
        .filter(|s| s.status.counts_against_limit())
        .map(|s| s.amount_minor)
        .sum();
    parent.amount_minor - committed
}

fn live_void(siblings: &[Transaction]) -> Option<&Transaction> {
    siblings
        .iter()
        .find(|s| s.transaction_type == TransactionType::Void && s.status.counts_against_limit())
}

impl PaymentEngine {
    /// The transaction tree rooted at `root_id`, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the root is unknown to the caller's merchant.
    pub async fn chain(&self, caller: &Caller, root_id: &TransactionId) -> Result<Vec<Transaction>> {
        self.check_scope(caller, Scope::PaymentsRead).await?;
        let root = self.load_transaction(&caller.merchant_id, root_id)?;

        let mut chain = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(txn) = queue.pop_front() {
            queue.extend(self.store.list_children(&txn.id)?);
            chain.push(txn);
        }
        chain.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(chain)
    }

    /// Validate a child operation against its parent and build its record.
    pub(crate) fn prepare_child(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        transaction_type: TransactionType,
        family: Option<PaymentMethodType>,
        parent_id: &TransactionId,
        request: FollowUpRequest,
    ) -> Result<Prepared> {
        let parent = self.load_transaction(merchant_id, parent_id)?;
        if family.is_some_and(|f| f != parent.payment_method_type) {
            return Err(PaymentError::Validation(format!(
                "transaction {parent_id} is not an ACH transaction"
            )));
        }
        transaction_type.check_parent(&parent)?;
        TranType::for_operation(transaction_type, parent.payment_method_type)?;

        let token = parent.financial_token().ok_or_else(|| {
            PaymentError::StateConflict(format!("transaction {parent_id} has no gateway reference"))
        })?;

        let siblings = self.store.list_children(&parent.id)?;
        let amount_minor = if transaction_type == TransactionType::Void {
            if let Some(blocking) = siblings.iter().find(|s| s.status.counts_against_limit()) {
                return Err(PaymentError::StateConflict(format!(
                    "cannot void transaction {parent_id}: {:?} {} is {:?}",
                    blocking.transaction_type, blocking.id, blocking.status
                )));
            }
            parent.amount_minor
        } else if let Some(void) = live_void(&siblings) {
            return Err(PaymentError::StateConflict(format!(
                "cannot {} transaction {parent_id}: void {} is {:?}",
                transaction_type.verb(),
                void.id,
                void.status
            )));
        } else {
            let remaining = remaining_amount(&parent, &siblings, transaction_type);
            let amount = request.amount_minor.unwrap_or(remaining);
            if remaining <= 0 {
                return Err(PaymentError::StateConflict(format!(
                    "nothing left to {} on transaction {parent_id}",
                    transaction_type.verb()
                )));
            }
            if amount > remaining {
                return Err(PaymentError::StateConflict(format!(
                    "{} of {amount} exceeds remaining {remaining} on transaction {parent_id}",
                    transaction_type.verb()
                )));
            }
            amount
        };

        let txn = Draft {
            transaction_type,
            payment_method_type: parent.payment_method_type,
            amount_minor,
            currency: parent.currency.clone(),
            customer_id: parent.customer_id,
            payment_method: parent.payment_method.clone(),
            parent_transaction_id: Some(parent.id),
            browser: None,
            metadata: request.metadata,
        }
        .into_transaction(*merchant_id, key.as_str(), fingerprint);

        Ok(Prepared {
            txn,
            funding: Funding::Token(token),
            limit: Some(parent.amount_minor),
        })
    }

    /// Move the parent of an approved child: a void voids it, a refund that
    /// exhausts the captured amount marks it refunded.
    ///
    /// Failures are logged; the child's own outcome stands either way.
    pub(crate) fn apply_parent_effects(&self, child: &Transaction) {
        let Some(parent_id) = child.parent_transaction_id else {
            return;
        };

        let result = match child.transaction_type {
            TransactionType::Void => self
                .store
                .transition_transaction(
                    &parent_id,
                    &[TransactionStatus::Authorized, TransactionStatus::Captured],
                    &TransactionUpdate::status(TransactionStatus::Voided),
                )
                .map(Some),
            TransactionType::Refund => self.settle_refunded_parent(&parent_id),
            _ => Ok(None),
        };

        match result {
            Ok(Some(parent)) => tracing::info!(
                transaction_id = %parent.id,
                status = ?parent.status,
                child_id = %child.id,
                "Parent transaction updated"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                transaction_id = %parent_id,
                child_id = %child.id,
                error = %e,
                "Failed to update parent transaction"
            ),
        }
    }

    fn settle_refunded_parent(
        &self,
        parent_id: &TransactionId,
    ) -> z_payments_store::Result<Option<Transaction>> {
        let Some(parent) = self.store.get_transaction(parent_id)? else {
            return Ok(None);
        };
        let refunded: i64 = self
            .store
            .list_children(parent_id)?
            .iter()
            .filter(|c| {
                c.transaction_type == TransactionType::Refund
                    && c.status == TransactionStatus::Refunded
            })
            .map(|c| c.amount_minor)
            .sum();

        if refunded < parent.amount_minor {
            return Ok(None);
        }
        self.store
            .transition_transaction(
                parent_id,
                &[TransactionStatus::Captured],
                &TransactionUpdate::status(TransactionStatus::Refunded),
            )
            .map(Some)
    }
}
