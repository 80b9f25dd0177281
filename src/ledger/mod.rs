//! Event ledger: durable, idempotent store of transfers and chain cursors
//!
//! All state changes are compare-and-swap on the current state. A lost CAS
//! surfaces as `LedgerError::StaleState` and callers re-read rather than fail.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db;
use crate::error::LedgerError;
use crate::types::{
    Amendment, ChainSide, StatePatch, Transfer, TransferId, TransferState, TransitionRecord,
};

pub mod memory;

pub use memory::MemoryLedger;

/// Shared handle used by every engine component
pub type SharedLedger = Arc<dyn EventLedger>;

#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Insert a new `Observed` transfer. Returns `false` when the id already
    /// exists, in which case nothing is changed.
    async fn insert_if_absent(&self, transfer: &Transfer) -> Result<bool, LedgerError>;

    async fn get(&self, id: &TransferId) -> Result<Option<Transfer>, LedgerError>;

    /// CAS `from -> to`. Fails with `InvalidTransition` for edges outside the
    /// lifecycle graph and `StaleState` when the stored state is not `from`.
    async fn update_state(
        &self,
        id: &TransferId,
        from: TransferState,
        to: TransferState,
        patch: StatePatch,
    ) -> Result<Transfer, LedgerError>;

    /// Same-state CAS: the transfer must still be in `state`
    async fn amend(
        &self,
        id: &TransferId,
        state: TransferState,
        amendment: Amendment,
    ) -> Result<Transfer, LedgerError>;

    /// Operator remediation `Failed -> Confirmed`, resetting attempts
    async fn requeue_failed(&self, id: &TransferId) -> Result<Transfer, LedgerError>;

    async fn list_by_state(&self, state: TransferState) -> Result<Vec<Transfer>, LedgerError>;

    /// Transfers observed on `chain` within `[from_block, to_block]`
    async fn list_in_source_window(
        &self,
        chain: ChainSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Transfer>, LedgerError>;

    async fn flag_for_review(&self, id: &TransferId, reason: &str) -> Result<(), LedgerError>;

    /// Returns whether a flag was cleared
    async fn clear_review(&self, id: &TransferId) -> Result<bool, LedgerError>;

    async fn list_needing_review(&self) -> Result<Vec<Transfer>, LedgerError>;

    async fn count_by_state(&self) -> Result<BTreeMap<TransferState, i64>, LedgerError>;

    async fn history(&self, id: &TransferId) -> Result<Vec<TransitionRecord>, LedgerError>;

    async fn last_processed_block(&self, chain: ChainSide) -> Result<Option<u64>, LedgerError>;

    /// Persist the ingestion cursor. Never moves backwards.
    async fn set_last_processed_block(
        &self,
        chain: ChainSide,
        block: u64,
    ) -> Result<(), LedgerError>;
}

/// PostgreSQL-backed ledger
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventLedger for PgLedger {
    async fn insert_if_absent(&self, transfer: &Transfer) -> Result<bool, LedgerError> {
        db::insert_transfer_if_absent(&self.pool, transfer).await
    }

    async fn get(&self, id: &TransferId) -> Result<Option<Transfer>, LedgerError> {
        db::get_transfer(&self.pool, id).await
    }

    async fn update_state(
        &self,
        id: &TransferId,
        from: TransferState,
        to: TransferState,
        patch: StatePatch,
    ) -> Result<Transfer, LedgerError> {
        db::transition_transfer(&self.pool, id, from, to, &patch).await
    }

    async fn amend(
        &self,
        id: &TransferId,
        state: TransferState,
        amendment: Amendment,
    ) -> Result<Transfer, LedgerError> {
        db::amend_transfer(&self.pool, id, state, &amendment).await
    }

    async fn requeue_failed(&self, id: &TransferId) -> Result<Transfer, LedgerError> {
        db::requeue_failed_transfer(&self.pool, id).await
    }

    async fn list_by_state(&self, state: TransferState) -> Result<Vec<Transfer>, LedgerError> {
        db::list_transfers_by_state(&self.pool, state).await
    }

    async fn list_in_source_window(
        &self,
        chain: ChainSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Transfer>, LedgerError> {
        db::list_transfers_in_source_window(&self.pool, chain, from_block, to_block).await
    }

    async fn flag_for_review(&self, id: &TransferId, reason: &str) -> Result<(), LedgerError> {
        db::flag_transfer_for_review(&self.pool, id, reason).await
    }

    async fn clear_review(&self, id: &TransferId) -> Result<bool, LedgerError> {
        db::clear_transfer_review(&self.pool, id).await
    }

    async fn list_needing_review(&self) -> Result<Vec<Transfer>, LedgerError> {
        db::list_transfers_needing_review(&self.pool).await
    }

    async fn count_by_state(&self) -> Result<BTreeMap<TransferState, i64>, LedgerError> {
        Ok(db::count_transfers_by_state(&self.pool)
            .await?
            .into_iter()
            .collect())
    }

    async fn history(&self, id: &TransferId) -> Result<Vec<TransitionRecord>, LedgerError> {
        db::get_transfer_history(&self.pool, id).await
    }

    async fn last_processed_block(&self, chain: ChainSide) -> Result<Option<u64>, LedgerError> {
        db::get_last_processed_block(&self.pool, chain).await
    }

    async fn set_last_processed_block(
        &self,
        chain: ChainSide,
        block: u64,
    ) -> Result<(), LedgerError> {
        db::update_last_processed_block(&self.pool, chain, block).await
    }
}
