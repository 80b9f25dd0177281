//! In-process ledger with the same compare-and-swap semantics as `PgLedger`

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::EventLedger;
use crate::error::LedgerError;
use crate::types::{
    Amendment, ChainSide, StatePatch, Transfer, TransferId, TransferState, TransitionRecord,
};

#[derive(Default)]
struct Inner {
    transfers: HashMap<TransferId, Transfer>,
    cursors: HashMap<ChainSide, u64>,
    history: Vec<TransitionRecord>,
}

impl Inner {
    fn record(
        &mut self,
        id: TransferId,
        from: Option<TransferState>,
        to: TransferState,
        reason: Option<String>,
    ) {
        self.history.push(TransitionRecord {
            transfer_id: id,
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }

    /// Borrow a transfer that must currently be in `expected`
    fn expect_state(
        &mut self,
        id: &TransferId,
        expected: TransferState,
    ) -> Result<&mut Transfer, LedgerError> {
        let transfer = self
            .transfers
            .get_mut(id)
            .ok_or(LedgerError::NotFound(*id))?;
        if transfer.state != expected {
            return Err(LedgerError::StaleState {
                id: *id,
                expected,
                actual: transfer.state,
            });
        }
        Ok(transfer)
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer, ordered by source position
    pub async fn all(&self) -> Vec<Transfer> {
        let inner = self.inner.lock().await;
        let mut transfers: Vec<Transfer> = inner.transfers.values().cloned().collect();
        sort_by_position(&mut transfers);
        transfers
    }
}

fn sort_by_position(transfers: &mut [Transfer]) {
    transfers.sort_by_key(|t| (t.observed_at_block, t.log_index, t.id));
}

#[async_trait]
impl EventLedger for MemoryLedger {
    async fn insert_if_absent(&self, transfer: &Transfer) -> Result<bool, LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.transfers.contains_key(&transfer.id) {
            return Ok(false);
        }
        inner.transfers.insert(transfer.id, transfer.clone());
        inner.record(transfer.id, None, transfer.state, Some("observed".to_string()));
        Ok(true)
    }

    async fn get(&self, id: &TransferId) -> Result<Option<Transfer>, LedgerError> {
        Ok(self.inner.lock().await.transfers.get(id).cloned())
    }

    async fn update_state(
        &self,
        id: &TransferId,
        from: TransferState,
        to: TransferState,
        patch: StatePatch,
    ) -> Result<Transfer, LedgerError> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition { from, to });
        }

        let mut inner = self.inner.lock().await;
        let transfer = inner.expect_state(id, from)?;

        transfer.state = to;
        if let Some(hash) = patch.dest_tx_hash {
            transfer.dest_tx_hash = Some(hash);
        }
        if patch.increment_attempts {
            transfer.attempts += 1;
        }
        transfer.retry_after = patch.retry_after;
        if let Some(error) = patch.last_error {
            transfer.last_error = Some(error);
        }
        if let Some(confirmations) = patch.confirmations {
            transfer.confirmations = confirmations;
        }
        transfer.updated_at = Utc::now();
        let updated = transfer.clone();

        inner.record(*id, Some(from), to, patch.reason);
        Ok(updated)
    }

    async fn amend(
        &self,
        id: &TransferId,
        state: TransferState,
        amendment: Amendment,
    ) -> Result<Transfer, LedgerError> {
        let mut inner = self.inner.lock().await;
        let transfer = inner.expect_state(id, state)?;

        match amendment {
            Amendment::Confirmations(confirmations) => transfer.confirmations = confirmations,
            Amendment::DestTxHash(hash) => transfer.dest_tx_hash = Some(hash),
            Amendment::Relocate { block, block_hash } => {
                transfer.observed_at_block = block;
                transfer.observed_block_hash = block_hash;
                transfer.confirmations = 0;
            }
        }
        transfer.updated_at = Utc::now();
        Ok(transfer.clone())
    }

    async fn requeue_failed(&self, id: &TransferId) -> Result<Transfer, LedgerError> {
        let mut inner = self.inner.lock().await;
        let transfer = inner.expect_state(id, TransferState::Failed)?;

        transfer.state = TransferState::Confirmed;
        transfer.attempts = 0;
        transfer.retry_after = None;
        transfer.updated_at = Utc::now();
        let updated = transfer.clone();

        inner.record(
            *id,
            Some(TransferState::Failed),
            TransferState::Confirmed,
            Some("operator requeue".to_string()),
        );
        Ok(updated)
    }

    async fn list_by_state(&self, state: TransferState) -> Result<Vec<Transfer>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut transfers: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        sort_by_position(&mut transfers);
        Ok(transfers)
    }

    async fn list_in_source_window(
        &self,
        chain: ChainSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut transfers: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| {
                t.source_chain == chain
                    && t.observed_at_block >= from_block
                    && t.observed_at_block <= to_block
            })
            .cloned()
            .collect();
        sort_by_position(&mut transfers);
        Ok(transfers)
    }

    async fn flag_for_review(&self, id: &TransferId, reason: &str) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let transfer = inner
            .transfers
            .get_mut(id)
            .ok_or(LedgerError::NotFound(*id))?;
        transfer.needs_review = true;
        transfer.review_reason = Some(reason.to_string());
        transfer.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_review(&self, id: &TransferId) -> Result<bool, LedgerError> {
        let mut inner = self.inner.lock().await;
        let transfer = inner
            .transfers
            .get_mut(id)
            .ok_or(LedgerError::NotFound(*id))?;
        let was_flagged = transfer.needs_review;
        transfer.needs_review = false;
        Ok(was_flagged)
    }

    async fn list_needing_review(&self) -> Result<Vec<Transfer>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut transfers: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| t.needs_review)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.updated_at);
        Ok(transfers)
    }

    async fn count_by_state(&self) -> Result<BTreeMap<TransferState, i64>, LedgerError> {
        let inner = self.inner.lock().await;
        let mut counts = BTreeMap::new();
        for transfer in inner.transfers.values() {
            *counts.entry(transfer.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn history(&self, id: &TransferId) -> Result<Vec<TransitionRecord>, LedgerError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .history
            .iter()
            .filter(|r| &r.transfer_id == id)
            .cloned()
            .collect())
    }

    async fn last_processed_block(&self, chain: ChainSide) -> Result<Option<u64>, LedgerError> {
        Ok(self.inner.lock().await.cursors.get(&chain).copied())
    }

    async fn set_last_processed_block(
        &self,
        chain: ChainSide,
        block: u64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner.cursors.entry(chain).or_insert(block);
        *cursor = (*cursor).max(block);
        Ok(())
    }
}
