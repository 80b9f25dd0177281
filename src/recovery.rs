//! Startup recovery
//!
//! Reads the persisted cursors and the lifecycle snapshot before any loop
//! starts. `Submitting` transfers are handed back to their destination worker,
//! which checks the destination chain before it signs anything new.

use eyre::{Result, WrapErr};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::ledger::EventLedger;
use crate::metrics;
use crate::types::{ChainSide, Transfer, TransferState};

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub cursors: BTreeMap<ChainSide, Option<u64>>,
    pub counts: BTreeMap<TransferState, i64>,
    /// Interrupted submissions, in source order
    pub reclaimed: Vec<Transfer>,
    pub needs_review: usize,
}

impl RecoveryReport {
    pub fn reclaimed_for(&self, dest: ChainSide) -> Vec<Transfer> {
        self.reclaimed
            .iter()
            .filter(|t| t.dest_chain == dest)
            .cloned()
            .collect()
    }

    pub fn count(&self, state: TransferState) -> i64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

pub async fn recover(ledger: &dyn EventLedger) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for side in ChainSide::ALL {
        let cursor = ledger
            .last_processed_block(side)
            .await
            .wrap_err_with(|| format!("Failed to read cursor for chain {}", side))?;
        if let Some(block) = cursor {
            metrics::record_cursor(side.as_str(), block);
        }
        report.cursors.insert(side, cursor);
    }

    report.counts = ledger
        .count_by_state()
        .await
        .wrap_err("Failed to count transfers by state")?;
    metrics::set_state_counts(&report.counts);

    report.reclaimed = ledger
        .list_by_state(TransferState::Submitting)
        .await
        .wrap_err("Failed to list interrupted submissions")?;
    report.needs_review = ledger.list_needing_review().await?.len();

    info!(
        cursor_a = ?report.cursors.get(&ChainSide::A).copied().flatten(),
        cursor_b = ?report.cursors.get(&ChainSide::B).copied().flatten(),
        confirmed = report.count(TransferState::Confirmed),
        submitting = report.reclaimed.len(),
        submitted = report.count(TransferState::Submitted),
        failed = report.count(TransferState::Failed),
        "Recovered ledger state"
    );
    for transfer in &report.reclaimed {
        info!(
            transfer_id = %transfer.id,
            dest_chain = %transfer.dest_chain,
            dest_tx_hash = ?transfer.dest_tx_hash,
            "Reclaiming interrupted submission"
        );
    }
    if report.needs_review > 0 {
        warn!(
            count = report.needs_review,
            "Transfers awaiting operator review"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::testing::sample_event;

    #[tokio::test]
    async fn test_recover_empty_ledger() {
        let ledger = MemoryLedger::new();
        let report = recover(&ledger).await.unwrap();
        assert_eq!(report.cursors.get(&ChainSide::A), Some(&None));
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.count(TransferState::Observed), 0);
    }

    #[tokio::test]
    async fn test_recover_reclaims_submitting_by_destination() {
        let ledger = MemoryLedger::new();
        ledger.set_last_processed_block(ChainSide::A, 120).await.unwrap();

        let mut to_b = Transfer::from_event(&sample_event(ChainSide::A, 100, 0));
        to_b.state = TransferState::Submitting;
        let mut to_a = Transfer::from_event(&sample_event(ChainSide::B, 40, 1));
        to_a.state = TransferState::Submitting;
        let mut confirmed = Transfer::from_event(&sample_event(ChainSide::A, 101, 0));
        confirmed.state = TransferState::Confirmed;
        for t in [&to_b, &to_a, &confirmed] {
            ledger.insert_if_absent(t).await.unwrap();
        }

        let report = recover(&ledger).await.unwrap();
        assert_eq!(report.cursors.get(&ChainSide::A), Some(&Some(120)));
        assert_eq!(report.reclaimed.len(), 2);
        assert_eq!(report.reclaimed_for(ChainSide::B), vec![to_b]);
        assert_eq!(report.reclaimed_for(ChainSide::A), vec![to_a]);
        assert_eq!(report.count(TransferState::Confirmed), 1);
    }
}
