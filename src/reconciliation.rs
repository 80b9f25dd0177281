//! Reconciliation scanner
//!
//! Independently of the live subscription, re-reads the last K blocks of each
//! chain and diffs them against the ledger: missing events are backfilled,
//! rows whose event left the canonical chain are reverted (or flagged when the
//! destination was already acted upon) and rows whose event moved are
//! re-located.
//!
//! An event absent from `eth_getLogs` only counts as orphaned once the block
//! it was observed in has been replaced. While that block is still canonical
//! the node's log index is assumed to lag and the row is left for the next
//! pass.

use alloy::primitives::B256;
use eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::SharedConnector;
use crate::error::LedgerError;
use crate::ledger::SharedLedger;
use crate::metrics;
use crate::state_machine::{Observation, TransferStateMachine};
use crate::types::{ChainSide, RawEvent, Transfer, TransferId, TransferState};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// K: how far back each pass looks. Must exceed any plausible reorg depth.
    pub lookback_blocks: u64,
    pub max_block_range: u64,
    pub interval: Duration,
}

/// A chain to scan together with its source confirmation requirement
#[derive(Clone)]
pub struct ScanTarget {
    pub connector: SharedConnector,
    pub required_confirmations: u64,
}

/// What one pass over one chain changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub chain: ChainSide,
    pub from: u64,
    pub to: u64,
    pub backfilled: usize,
    pub reverted: usize,
    pub relocated: usize,
    pub flagged: usize,
    /// Missing from the logs while their block is still canonical
    pub deferred: usize,
}

impl ScanReport {
    fn new(chain: ChainSide, from: u64, to: u64) -> Self {
        Self {
            chain,
            from,
            to,
            backfilled: 0,
            reverted: 0,
            relocated: 0,
            flagged: 0,
            deferred: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.backfilled == 0 && self.reverted == 0 && self.relocated == 0 && self.flagged == 0
    }
}

pub struct ReconciliationScanner {
    targets: Vec<ScanTarget>,
    ledger: SharedLedger,
    machine: TransferStateMachine,
    config: ReconcilerConfig,
}

impl ReconciliationScanner {
    pub fn new(
        targets: Vec<ScanTarget>,
        machine: TransferStateMachine,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            targets,
            ledger: machine.ledger().clone(),
            machine,
            config,
        }
    }

    /// One pass over every chain. A failing chain does not stop the others.
    pub async fn scan_all(&self) -> Vec<Result<ScanReport>> {
        let mut reports = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            reports.push(self.scan_chain(target).await);
        }
        reports
    }

    pub async fn scan_chain(&self, target: &ScanTarget) -> Result<ScanReport> {
        let connector = &target.connector;
        let side = connector.side();
        let height = connector
            .current_height()
            .await
            .wrap_err_with(|| format!("Failed to get height of chain {}", side))?;
        let from = height.saturating_sub(self.config.lookback_blocks);
        let mut report = ScanReport::new(side, from, height);

        let events = self.fetch_window(target, from, height).await?;
        let onchain: HashMap<TransferId, &RawEvent> =
            events.iter().map(|e| (e.transfer_id(), e)).collect();

        for event in &events {
            if self.machine.observe(event).await? == Observation::Inserted {
                warn!(
                    chain = %side,
                    transfer_id = %event.transfer_id(),
                    block = event.block_number,
                    "Backfilled event missed by live ingestion"
                );
                report.backfilled += 1;
            }
        }

        let mut canonical_hashes: HashMap<u64, Option<B256>> = HashMap::new();
        for transfer in self.ledger.list_in_source_window(side, from, height).await? {
            let result = match onchain.get(&transfer.id) {
                None => {
                    let block = transfer.observed_at_block;
                    let canonical = match canonical_hashes.get(&block) {
                        Some(hash) => *hash,
                        None => {
                            let hash = connector.block_hash(block).await.wrap_err_with(|| {
                                format!("Failed to get hash of block {} on chain {}", block, side)
                            })?;
                            canonical_hashes.insert(block, hash);
                            hash
                        }
                    };
                    self.handle_missing(&transfer, canonical, &mut report).await
                }
                Some(event) => {
                    self.handle_present(&transfer, event, target, height, &mut report)
                        .await
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    debug!(transfer_id = %transfer.id, "Transfer moved during reconciliation");
                }
                Err(e) => return Err(e.into()),
            }
        }

        metrics::record_reconciliation(side.as_str(), "backfilled", report.backfilled);
        metrics::record_reconciliation(side.as_str(), "reverted", report.reverted);
        metrics::record_reconciliation(side.as_str(), "relocated", report.relocated);
        metrics::record_reconciliation(side.as_str(), "flagged", report.flagged);
        metrics::record_reconciliation(side.as_str(), "deferred", report.deferred);

        if report.is_clean() {
            debug!(chain = %side, from_block = from, to_block = height, "Reconciliation clean");
        } else {
            info!(
                chain = %side,
                from_block = from,
                to_block = height,
                backfilled = report.backfilled,
                reverted = report.reverted,
                relocated = report.relocated,
                flagged = report.flagged,
                deferred = report.deferred,
                "Reconciliation pass applied corrections"
            );
        }
        Ok(report)
    }

    async fn fetch_window(
        &self,
        target: &ScanTarget,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>> {
        let range = self.config.max_block_range.max(1);
        let mut events = Vec::new();
        let mut start = from;
        while start <= to {
            let end = to.min(start.saturating_add(range - 1));
            events.extend(target.connector.fetch_events(start, end).await?);
            start = end + 1;
        }
        Ok(events)
    }

    /// `canonical` is the current hash of the block the event was observed in
    async fn handle_missing(
        &self,
        transfer: &Transfer,
        canonical: Option<B256>,
        report: &mut ScanReport,
    ) -> Result<(), LedgerError> {
        if matches!(transfer.state, TransferState::Reverted | TransferState::Failed) {
            return Ok(());
        }
        let replaced = canonical.is_some_and(|hash| hash != transfer.observed_block_hash);
        if !replaced {
            warn!(
                transfer_id = %transfer.id,
                state = %transfer.state,
                block = transfer.observed_at_block,
                "Source event missing from logs but its block is still canonical, rechecking next pass"
            );
            report.deferred += 1;
            return Ok(());
        }

        match transfer.state {
            TransferState::Observed | TransferState::Confirmed => {
                self.machine
                    .revert(transfer, "source event no longer in canonical chain")
                    .await?;
                report.reverted += 1;
            }
            TransferState::Submitting | TransferState::Submitted | TransferState::Finalized => {
                if !transfer.needs_review {
                    self.machine
                        .flag_inconsistency(
                            transfer,
                            "source event left the canonical chain after destination action",
                        )
                        .await?;
                    report.flagged += 1;
                }
            }
            TransferState::Reverted | TransferState::Failed => {}
        }
        Ok(())
    }

    async fn handle_present(
        &self,
        transfer: &Transfer,
        event: &RawEvent,
        target: &ScanTarget,
        height: u64,
        report: &mut ScanReport,
    ) -> Result<(), LedgerError> {
        if transfer.state == TransferState::Reverted {
            // terminal; the event came back after being written off
            if !transfer.needs_review {
                self.machine
                    .flag_inconsistency(transfer, "reverted transfer reappeared on canonical chain")
                    .await?;
                report.flagged += 1;
            }
            return Ok(());
        }

        let moved = event.block_number != transfer.observed_at_block
            || event.block_hash != transfer.observed_block_hash;
        if !moved {
            return Ok(());
        }

        match transfer.state {
            TransferState::Observed | TransferState::Confirmed => {
                self.machine
                    .relocate(
                        transfer,
                        event.block_number,
                        event.block_hash,
                        height,
                        target.required_confirmations,
                    )
                    .await?;
                report.relocated += 1;
            }
            TransferState::Submitting | TransferState::Submitted | TransferState::Finalized => {
                if !transfer.needs_review {
                    warn!(
                        transfer_id = %transfer.id,
                        state = %transfer.state,
                        old_block = transfer.observed_at_block,
                        new_block = event.block_number,
                        "Source event moved after destination action"
                    );
                    self.machine
                        .flag_inconsistency(
                            transfer,
                            "source event re-located after destination action",
                        )
                        .await?;
                    report.flagged += 1;
                }
            }
            _ => {
                debug!(
                    transfer_id = %transfer.id,
                    state = %transfer.state,
                    old_block = transfer.observed_at_block,
                    new_block = event.block_number,
                    "Source event of a failed transfer moved, keeping record"
                );
            }
        }
        Ok(())
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            chains = self.targets.len(),
            lookback_blocks = self.config.lookback_blocks,
            interval_secs = self.config.interval.as_secs(),
            "Reconciliation scanner starting"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let reports = tokio::select! {
                _ = cancel.cancelled() => break,
                reports = self.scan_all() => reports,
            };
            for (target, result) in self.targets.iter().zip(reports) {
                if let Err(e) = result {
                    error!(
                        chain = %target.connector.side(),
                        error = %e,
                        "Reconciliation pass failed"
                    );
                }
            }
        }

        info!("Reconciliation scanner stopped");
        Ok(())
    }
}
