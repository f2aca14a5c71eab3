//! Idempotency ledger: at-most-once execution per `(merchant, key)`.
//!
//! A call first reserves its key with a short lease. The holder either
//! finalizes the key with the produced result (replayed for the retention
//! window) or releases it when nothing durable happened, so the same key can
//! be retried at once. A crashed holder's lease simply lapses.

use std::future::Future;

use chrono::Utc;

use z_payments_core::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, LedgerResult, MerchantId, PaymentError,
    Processed, RequestFingerprint, Result,
};
use z_payments_store::Reservation;

use crate::config::chrono_duration;
use crate::engine::PaymentEngine;

/// Outcome of reserving a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The caller owns the key and must finalize or release it.
    Fresh,
    /// An earlier call with the same request already finished.
    Replay(LedgerResult),
}

/// A value an idempotent call can store in the ledger.
pub(crate) trait LedgerEntry {
    fn ledger_result(&self) -> LedgerResult;
}

impl PaymentEngine {
    /// Reserve `key`, waiting up to the in-flight window for a concurrent
    /// holder to finish.
    ///
    /// # Errors
    ///
    /// - `PaymentError::IdempotencyConflict` if the key was used with a
    ///   different request.
    /// - `PaymentError::RequestInProgress` if a holder is still running when
    ///   the wait ends.
    pub(crate) async fn admit(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<Admission> {
        let lease = chrono_duration(self.config.reservation_lease);
        let deadline = Utc::now() + chrono_duration(self.config.in_flight_wait);

        loop {
            let now = Utc::now();
            let candidate =
                IdempotencyRecord::reserve(*merchant_id, key.clone(), fingerprint.clone(), now + lease);

            let existing = match self.store.reserve_idempotency_key(&candidate, now)? {
                Reservation::Acquired => return Ok(Admission::Fresh),
                Reservation::Existing(record) => record,
            };

            if existing.fingerprint != *fingerprint {
                tracing::warn!(
                    merchant_id = %merchant_id,
                    key = %key,
                    "Idempotency key reused with a different request"
                );
                return Err(PaymentError::IdempotencyConflict {
                    key: key.to_string(),
                });
            }

            match existing.state {
                IdempotencyState::Finalized { result, .. } => {
                    tracing::debug!(merchant_id = %merchant_id, key = %key, "Replaying stored result");
                    return Ok(Admission::Replay(result));
                }
                IdempotencyState::Reserved { lease_expires_at } => {
                    if Utc::now() >= deadline {
                        let remaining = (lease_expires_at - Utc::now()).num_seconds().max(1);
                        return Err(PaymentError::RequestInProgress {
                            key: key.to_string(),
                            retry_after_secs: u64::try_from(remaining).unwrap_or(1),
                        });
                    }
                    tokio::time::sleep(self.config.in_flight_poll).await;
                }
            }
        }
    }

    /// Store the final result of a key. Failure is logged, not surfaced: the
    /// operation already happened, and a retry after the lease lapses finds
    /// the record through its unique key index.
    pub(crate) fn finalize(&self, merchant_id: &MerchantId, key: &IdempotencyKey, result: LedgerResult) {
        let expires_at = Utc::now() + chrono_duration(self.config.result_retention);
        if let Err(e) = self
            .store
            .finalize_idempotency_key(merchant_id, key, result, expires_at)
        {
            tracing::error!(merchant_id = %merchant_id, key = %key, error = %e, "Failed to finalize idempotency key");
        }
    }

    /// Drop a reservation so the key is immediately retryable.
    pub(crate) fn release(&self, merchant_id: &MerchantId, key: &IdempotencyKey) {
        if let Err(e) = self.store.release_idempotency_key(merchant_id, key) {
            tracing::error!(merchant_id = %merchant_id, key = %key, error = %e, "Failed to release idempotency key");
        }
    }

    /// Run `run` at most once per `(merchant, key)`.
    ///
    /// A replay is answered by `replay`, which reloads the stored result.
    /// Successful runs finalize the key; failed runs release it.
    pub(crate) async fn run_idempotent<T, R, RFut, F, Fut>(
        &self,
        merchant_id: &MerchantId,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        replay: R,
        run: F,
    ) -> Result<Processed<T>>
    where
        T: LedgerEntry,
        R: FnOnce(LedgerResult) -> RFut,
        RFut: Future<Output = Result<T>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Processed<T>>>,
    {
        match self.admit(merchant_id, key, fingerprint).await? {
            Admission::Replay(result) => replay(result).await.map(Processed::replayed),
            Admission::Fresh => match run().await {
                Ok(processed) => {
                    self.finalize(merchant_id, key, processed.value.ledger_result());
                    Ok(processed)
                }
                Err(e) => {
                    self.release(merchant_id, key);
                    Err(e)
                }
            },
        }
    }

    /// Remove ledger records past their lease or retention.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::Storage` if the sweep fails.
    pub fn purge_idempotency_ledger(&self) -> Result<usize> {
        let purged = self.store.purge_idempotency_records(Utc::now())?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

/// Error for a replayed ledger entry of an unexpected kind.
pub(crate) fn unexpected_entry(key: &IdempotencyKey, result: LedgerResult) -> PaymentError {
    tracing::error!(key = %key, result = ?result, "Ledger entry kind does not match operation");
    PaymentError::IdempotencyConflict {
        key: key.to_string(),
    }
}
