//! Transfer state machine
//!
//! The only place that decides lifecycle transitions. Every method is a single
//! compare-and-swap against the ledger, so concurrent callers racing on the
//! same transfer see at most one winner and `StaleState` for the rest.

use alloy::primitives::B256;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{LedgerError, SubmitError};
use crate::ledger::SharedLedger;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::{Amendment, RawEvent, StatePatch, Transfer, TransferId, TransferState};

/// Result of handing an event to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    Duplicate,
}

/// What happened to a transfer after a failed submission attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to `Confirmed`, eligible again once `retry_after` passes
    Retrying(Transfer),
    Failed(Transfer),
}

#[derive(Clone)]
pub struct TransferStateMachine {
    ledger: SharedLedger,
    retry: RetryConfig,
}

impl TransferStateMachine {
    pub fn new(ledger: SharedLedger, retry: RetryConfig) -> Self {
        Self { ledger, retry }
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Record an event as `Observed` unless its id is already known
    pub async fn observe(&self, event: &RawEvent) -> Result<Observation, LedgerError> {
        let transfer = Transfer::from_event(event);
        if self.ledger.insert_if_absent(&transfer).await? {
            metrics::EVENTS_OBSERVED
                .with_label_values(&[event.source.as_str()])
                .inc();
            info!(
                transfer_id = %transfer.id,
                chain = %event.source,
                tx_hash = %event.tx_hash,
                log_index = event.log_index,
                block = event.block_number,
                user = %event.user,
                amount = %event.amount,
                "New bridge transfer observed"
            );
            Ok(Observation::Inserted)
        } else {
            metrics::EVENTS_DUPLICATE
                .with_label_values(&[event.source.as_str()])
                .inc();
            Ok(Observation::Duplicate)
        }
    }

    /// Update the confirmation count of an `Observed` transfer and promote it
    /// to `Confirmed` once `required` is reached.
    pub async fn refresh_confirmations(
        &self,
        transfer: &Transfer,
        height: u64,
        required: u64,
    ) -> Result<TransferState, LedgerError> {
        let confirmations = transfer.depth_at(height);
        if confirmations >= required {
            let confirmed = self
                .ledger
                .update_state(
                    &transfer.id,
                    TransferState::Observed,
                    TransferState::Confirmed,
                    StatePatch {
                        confirmations: Some(confirmations),
                        reason: Some(format!("{} confirmations at height {}", confirmations, height)),
                        ..Default::default()
                    },
                )
                .await?;
            self.transitioned(TransferState::Observed, TransferState::Confirmed);
            info!(
                transfer_id = %confirmed.id,
                chain = %confirmed.source_chain,
                confirmations,
                "Transfer confirmed"
            );
            Ok(TransferState::Confirmed)
        } else {
            if confirmations != transfer.confirmations {
                self.ledger
                    .amend(
                        &transfer.id,
                        TransferState::Observed,
                        Amendment::Confirmations(confirmations),
                    )
                    .await?;
            }
            Ok(TransferState::Observed)
        }
    }

    /// `Confirmed -> Submitting`; counts as one attempt
    pub async fn claim(&self, id: &TransferId) -> Result<Transfer, LedgerError> {
        let claimed = self
            .ledger
            .update_state(
                id,
                TransferState::Confirmed,
                TransferState::Submitting,
                StatePatch {
                    increment_attempts: true,
                    reason: Some("claimed for submission".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Confirmed, TransferState::Submitting);
        Ok(claimed)
    }

    /// Persist the signed destination hash before it is broadcast
    pub async fn record_prepared(&self, id: &TransferId, hash: B256) -> Result<Transfer, LedgerError> {
        self.ledger
            .amend(id, TransferState::Submitting, Amendment::DestTxHash(hash))
            .await
    }

    /// `Submitting -> Submitted`
    pub async fn mark_submitted(
        &self,
        id: &TransferId,
        hash: Option<B256>,
        reason: &str,
    ) -> Result<Transfer, LedgerError> {
        let submitted = self
            .ledger
            .update_state(
                id,
                TransferState::Submitting,
                TransferState::Submitted,
                StatePatch {
                    dest_tx_hash: hash,
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Submitting, TransferState::Submitted);
        Ok(submitted)
    }

    /// `Submitted -> Finalized`
    pub async fn finalize(
        &self,
        id: &TransferId,
        confirmations: Option<u64>,
        reason: &str,
    ) -> Result<Transfer, LedgerError> {
        let finalized = self
            .ledger
            .update_state(
                id,
                TransferState::Submitted,
                TransferState::Finalized,
                StatePatch {
                    confirmations,
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Submitted, TransferState::Finalized);
        info!(
            transfer_id = %finalized.id,
            dest_chain = %finalized.dest_chain,
            dest_tx_hash = ?finalized.dest_tx_hash,
            attempts = finalized.attempts,
            "Transfer finalized"
        );
        Ok(finalized)
    }

    /// Update the destination depth of a `Submitted` transfer
    pub async fn record_destination_depth(
        &self,
        id: &TransferId,
        confirmations: u64,
    ) -> Result<Transfer, LedgerError> {
        self.ledger
            .amend(
                id,
                TransferState::Submitted,
                Amendment::Confirmations(confirmations),
            )
            .await
    }

    /// `Submitted -> Submitting` to replace a dropped or reverted transaction;
    /// counts as a new attempt
    pub async fn begin_replacement(&self, id: &TransferId, reason: &str) -> Result<Transfer, LedgerError> {
        let replacing = self
            .ledger
            .update_state(
                id,
                TransferState::Submitted,
                TransferState::Submitting,
                StatePatch {
                    increment_attempts: true,
                    last_error: Some(reason.to_string()),
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Submitted, TransferState::Submitting);
        warn!(
            transfer_id = %replacing.id,
            attempts = replacing.attempts,
            previous_tx = ?replacing.dest_tx_hash,
            reason,
            "Replacing destination transaction"
        );
        Ok(replacing)
    }

    /// Resolve a failed attempt of a `Submitting` transfer: back to `Confirmed`
    /// with backoff, or `Failed` when the error is permanent or attempts are spent.
    pub async fn record_failure(
        &self,
        transfer: &Transfer,
        err: &SubmitError,
    ) -> Result<FailureOutcome, LedgerError> {
        let exhausted = !self.retry.should_retry(transfer.attempts);

        if err.is_permanent() || exhausted {
            let reason = if err.is_permanent() {
                format!("permanent error: {}", err.message())
            } else {
                format!(
                    "attempts exhausted ({}): {}",
                    transfer.attempts,
                    err.message()
                )
            };
            let failed = self.fail(&transfer.id, &reason).await?;
            return Ok(FailureOutcome::Failed(failed));
        }

        let retry_after = self.retry.next_retry_after(transfer.attempts);
        let retrying = self
            .ledger
            .update_state(
                &transfer.id,
                TransferState::Submitting,
                TransferState::Confirmed,
                StatePatch {
                    retry_after: Some(retry_after),
                    last_error: Some(err.message().to_string()),
                    reason: Some(format!("transient error: {}", err.message())),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Submitting, TransferState::Confirmed);
        warn!(
            transfer_id = %retrying.id,
            attempts = retrying.attempts,
            max_attempts = self.retry.max_attempts,
            retry_after = %retry_after,
            error = %err,
            "Submission failed, will retry"
        );
        Ok(FailureOutcome::Retrying(retrying))
    }

    /// `Submitting -> Failed`
    pub async fn fail(&self, id: &TransferId, reason: &str) -> Result<Transfer, LedgerError> {
        let failed = self
            .ledger
            .update_state(
                id,
                TransferState::Submitting,
                TransferState::Failed,
                StatePatch {
                    last_error: Some(reason.to_string()),
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.transitioned(TransferState::Submitting, TransferState::Failed);
        metrics::PERMANENT_FAILURES
            .with_label_values(&[failed.dest_chain.as_str()])
            .inc();
        error!(
            transfer_id = %failed.id,
            dest_chain = %failed.dest_chain,
            attempts = failed.attempts,
            reason,
            "Transfer failed permanently"
        );
        Ok(failed)
    }

    /// Source event disappeared before any destination action
    pub async fn revert(&self, transfer: &Transfer, reason: &str) -> Result<Transfer, LedgerError> {
        let reverted = self
            .ledger
            .update_state(
                &transfer.id,
                transfer.state,
                TransferState::Reverted,
                StatePatch::reason(reason),
            )
            .await?;
        self.transitioned(transfer.state, TransferState::Reverted);
        warn!(
            transfer_id = %reverted.id,
            chain = %reverted.source_chain,
            block = reverted.observed_at_block,
            from_state = %transfer.state,
            reason,
            "Transfer reverted by source chain reorganization"
        );
        Ok(reverted)
    }

    /// The source event now lives at another block. `Confirmed` transfers whose
    /// new block is not deep enough drop back to `Observed`.
    pub async fn relocate(
        &self,
        transfer: &Transfer,
        block: u64,
        block_hash: B256,
        height: u64,
        required: u64,
    ) -> Result<Transfer, LedgerError> {
        let relocated = self
            .ledger
            .amend(
                &transfer.id,
                transfer.state,
                Amendment::Relocate { block, block_hash },
            )
            .await?;
        info!(
            transfer_id = %relocated.id,
            chain = %relocated.source_chain,
            old_block = transfer.observed_at_block,
            new_block = block,
            "Transfer re-located after reorganization"
        );

        if relocated.state == TransferState::Confirmed && relocated.depth_at(height) < required {
            let demoted = self
                .ledger
                .update_state(
                    &relocated.id,
                    TransferState::Confirmed,
                    TransferState::Observed,
                    StatePatch::reason(format!(
                        "re-located to block {} below required depth",
                        block
                    )),
                )
                .await?;
            self.transitioned(TransferState::Confirmed, TransferState::Observed);
            return Ok(demoted);
        }
        Ok(relocated)
    }

    /// Source event vanished after the engine acted on the destination chain.
    /// The state is left as is; an operator has to look at it.
    pub async fn flag_inconsistency(&self, transfer: &Transfer, reason: &str) -> Result<(), LedgerError> {
        self.ledger.flag_for_review(&transfer.id, reason).await?;
        metrics::REORG_INCONSISTENCIES
            .with_label_values(&[transfer.source_chain.as_str()])
            .inc();
        error!(
            transfer_id = %transfer.id,
            chain = %transfer.source_chain,
            state = %transfer.state,
            dest_tx_hash = ?transfer.dest_tx_hash,
            reason,
            "Reorg inconsistency: source event changed after destination action"
        );
        Ok(())
    }

    /// Operator remediation: `Failed -> Confirmed` with a fresh attempt budget
    pub async fn requeue(&self, id: &TransferId) -> Result<Transfer, LedgerError> {
        let requeued = self.ledger.requeue_failed(id).await?;
        self.transitioned(TransferState::Failed, TransferState::Confirmed);
        info!(transfer_id = %id, at = %Utc::now(), "Failed transfer requeued by operator");
        Ok(requeued)
    }

    /// Operator remediation: clear a review flag. Returns whether one was set.
    pub async fn acknowledge(&self, id: &TransferId) -> Result<bool, LedgerError> {
        let cleared = self.ledger.clear_review(id).await?;
        if cleared {
            info!(transfer_id = %id, "Review flag acknowledged by operator");
        }
        Ok(cleared)
    }

    fn transitioned(&self, from: TransferState, to: TransferState) {
        metrics::STATE_TRANSITIONS
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}
