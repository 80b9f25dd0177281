//! Destination submission worker
//!
//! One worker per destination chain. It claims `Confirmed` transfers, signs
//! and broadcasts the compensating call under the chain's submission mutex,
//! and runs a tracker pass that finalizes or replaces `Submitted` transfers.
//!
//! Ordering per submission: claim, check the destination (recorded hash and
//! `processedTransfers`), persist the signed hash, broadcast, record
//! `Submitted`. A crash between any two steps is resolved on restart by the
//! same checks.

use chrono::Utc;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::{
    await_confirmation, ConfirmationOutcome, DestinationCall, PendingSubmission, SharedConnector,
    TxStatus,
};
use crate::error::{LedgerError, SubmitError};
use crate::ledger::SharedLedger;
use crate::metrics;
use crate::retry::{CircuitBreaker, CircuitBreakerConfig};
use crate::state_machine::{FailureOutcome, TransferStateMachine};
use crate::types::{Transfer, TransferState};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Confirmations required on the destination chain
    pub required_confirmations: u64,
    /// How long to wait for inclusion after broadcast, and how long a
    /// `Submitted` transaction may be unknown to the node before it is replaced
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// How a single submission attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// Included and already deep enough
    Finalized(Transfer),
    /// Broadcast (or adopted); the tracker finishes it
    Submitted(Transfer),
    /// The destination contract had already consumed the key
    AlreadyProcessed(Transfer),
    Retrying(Transfer),
    Failed(Transfer),
}

/// Counts from one tracker pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackReport {
    pub finalized: usize,
    pub replaced: usize,
    pub waiting: usize,
}

pub struct SubmissionWorker {
    connector: SharedConnector,
    ledger: SharedLedger,
    machine: TransferStateMachine,
    submit_lock: Arc<Mutex<()>>,
    config: WorkerConfig,
}

impl SubmissionWorker {
    pub fn new(
        connector: SharedConnector,
        machine: TransferStateMachine,
        config: WorkerConfig,
    ) -> Self {
        Self {
            connector,
            ledger: machine.ledger().clone(),
            machine,
            submit_lock: Arc::new(Mutex::new(())),
            config,
        }
    }

    /// Share a submission mutex with other users of the same signing key
    pub fn with_submit_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.submit_lock = lock;
        self
    }

    fn chain(&self) -> &'static str {
        self.connector.side().as_str()
    }

    /// Claim and submit every ready `Confirmed` transfer bound for this chain
    pub async fn process_confirmed(&self) -> Result<Vec<SubmissionOutcome>> {
        let side = self.connector.side();
        let height = self
            .connector
            .current_height()
            .await
            .wrap_err("Destination chain health check failed")?;
        metrics::record_height(side.as_str(), height);

        let now = Utc::now();
        let ready: Vec<Transfer> = self
            .ledger
            .list_by_state(TransferState::Confirmed)
            .await?
            .into_iter()
            .filter(|t| t.dest_chain == side && t.is_ready(now))
            .collect();

        if ready.is_empty() {
            return Ok(Vec::new());
        }
        debug!(chain = %side, count = ready.len(), "Claiming confirmed transfers");

        let mut outcomes = Vec::with_capacity(ready.len());
        for transfer in ready {
            let claimed = match self.machine.claim(&transfer.id).await {
                Ok(claimed) => claimed,
                Err(e) if e.is_stale() => {
                    debug!(transfer_id = %transfer.id, "Claim lost, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            outcomes.push(self.submit_claimed(claimed).await?);
        }
        Ok(outcomes)
    }

    /// Drive a `Submitting` transfer to `Submitted`, `Confirmed` (retry) or
    /// `Failed`. Safe to call for a transfer whose earlier attempt may have
    /// been broadcast.
    pub async fn submit_claimed(&self, transfer: Transfer) -> Result<SubmissionOutcome> {
        let _guard = self.submit_lock.lock().await;
        let started = Instant::now();
        let max_attempts = self.machine.retry_config().max_attempts;

        if transfer.attempts > max_attempts {
            let reason = format!("attempts exhausted after {} submissions", max_attempts);
            let failed = self.machine.fail(&transfer.id, &reason).await?;
            return Ok(SubmissionOutcome::Failed(failed));
        }

        // A hash recorded by an earlier attempt may already be in flight
        if let Some(previous) = transfer.dest_tx_hash {
            match self.connector.tx_status(previous).await {
                Ok(TxStatus::Pending)
                | Ok(TxStatus::Included {
                    success: true, ..
                }) => {
                    info!(
                        transfer_id = %transfer.id,
                        dest_tx_hash = %previous,
                        "Adopting previously broadcast transaction"
                    );
                    let submitted = self
                        .machine
                        .mark_submitted(&transfer.id, Some(previous), "adopted in-flight transaction")
                        .await?;
                    let handle = PendingSubmission {
                        chain: self.connector.side(),
                        hash: previous,
                    };
                    return self.await_inclusion(submitted, handle, started).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let err = SubmitError::Transient(format!("receipt lookup failed: {}", e));
                    return self.handle_failure(&transfer, err).await;
                }
            }
        }

        match self.connector.is_processed(&transfer.id).await {
            Ok(true) => {
                info!(
                    transfer_id = %transfer.id,
                    dest_chain = %transfer.dest_chain,
                    "Idempotency key already consumed on destination, not broadcasting"
                );
                return self.finalize_consumed(&transfer).await;
            }
            Ok(false) => {}
            Err(e) => {
                let err = SubmitError::Transient(format!("idempotency check failed: {}", e));
                return self.handle_failure(&transfer, err).await;
            }
        }

        let call = DestinationCall::for_transfer(&transfer);
        let prepared = match self.connector.prepare(&call).await {
            Ok(prepared) => prepared,
            Err(e) => return self.handle_failure(&transfer, e).await,
        };

        // Persisted before the transaction can exist anywhere else
        self.machine
            .record_prepared(&transfer.id, prepared.hash)
            .await?;

        let handle = match self.connector.broadcast(&prepared).await {
            Ok(handle) => handle,
            Err(e) => {
                metrics::record_submission(self.chain(), false);
                return self.handle_failure(&transfer, e).await;
            }
        };
        metrics::record_submission(self.chain(), true);

        info!(
            transfer_id = %transfer.id,
            call = %call.kind,
            user = %call.user,
            amount = %call.amount,
            attempt = call.attempt,
            dest_tx_hash = %handle.hash,
            "Destination transaction broadcast"
        );

        let submitted = self
            .machine
            .mark_submitted(&transfer.id, Some(handle.hash), "broadcast")
            .await?;
        self.await_inclusion(submitted, handle, started).await
    }

    /// Wait (bounded) for inclusion; finalize right away if already deep enough
    async fn await_inclusion(
        &self,
        submitted: Transfer,
        handle: PendingSubmission,
        started: Instant,
    ) -> Result<SubmissionOutcome> {
        let outcome = await_confirmation(
            self.connector.as_ref(),
            &handle,
            0,
            self.config.confirmation_timeout,
            self.config.poll_interval,
        )
        .await?;

        match outcome {
            ConfirmationOutcome::Confirmed(receipt) => {
                metrics::record_submission_latency(self.chain(), started.elapsed().as_secs_f64());
                if receipt.confirmations >= self.config.required_confirmations {
                    let finalized = self
                        .machine
                        .finalize(
                            &submitted.id,
                            Some(receipt.confirmations),
                            "destination transaction final",
                        )
                        .await?;
                    return Ok(SubmissionOutcome::Finalized(finalized));
                }
                debug!(
                    transfer_id = %submitted.id,
                    block = receipt.block,
                    "Destination transaction included, awaiting depth"
                );
            }
            ConfirmationOutcome::Reverted { block } => {
                warn!(
                    transfer_id = %submitted.id,
                    dest_tx_hash = %handle.hash,
                    block,
                    "Destination transaction reverted"
                );
            }
            ConfirmationOutcome::Dropped | ConfirmationOutcome::TimedOut => {
                debug!(
                    transfer_id = %submitted.id,
                    dest_tx_hash = %handle.hash,
                    outcome = ?outcome,
                    "Destination transaction not yet included"
                );
            }
        }
        Ok(SubmissionOutcome::Submitted(submitted))
    }

    /// `Submitting -> Submitted -> Finalized` without a transaction of ours
    async fn finalize_consumed(&self, transfer: &Transfer) -> Result<SubmissionOutcome> {
        self.machine
            .mark_submitted(&transfer.id, None, "idempotency key already consumed")
            .await?;
        let finalized = self
            .machine
            .finalize(&transfer.id, None, "destination already processed transfer")
            .await?;
        Ok(SubmissionOutcome::AlreadyProcessed(finalized))
    }

    async fn handle_failure(&self, transfer: &Transfer, err: SubmitError) -> Result<SubmissionOutcome> {
        // the key may have been consumed after the pre-broadcast check
        let err = if err.is_permanent() {
            match self.connector.is_processed(&transfer.id).await {
                Ok(true) => {
                    info!(
                        transfer_id = %transfer.id,
                        dest_chain = %transfer.dest_chain,
                        error = %err.message(),
                        "Submission rejected after idempotency key was consumed on destination"
                    );
                    return self.finalize_consumed(transfer).await;
                }
                Ok(false) => err,
                Err(e) => SubmitError::Transient(format!(
                    "idempotency check after \"{}\" failed: {}",
                    err.message(),
                    e
                )),
            }
        } else {
            err
        };

        Ok(match self.machine.record_failure(transfer, &err).await? {
            FailureOutcome::Retrying(t) => SubmissionOutcome::Retrying(t),
            FailureOutcome::Failed(t) => SubmissionOutcome::Failed(t),
        })
    }

    /// Check every `Submitted` transfer bound for this chain
    pub async fn track_submitted(&self) -> Result<TrackReport> {
        let side = self.connector.side();
        let mut report = TrackReport::default();

        for transfer in self.ledger.list_by_state(TransferState::Submitted).await? {
            if transfer.dest_chain != side {
                continue;
            }
            match self.track_one(&transfer).await {
                Ok(TrackAction::Finalized) => report.finalized += 1,
                Ok(TrackAction::Replaced) => report.replaced += 1,
                Ok(TrackAction::Waiting) => report.waiting += 1,
                Err(e) if is_stale(&e) => {
                    debug!(transfer_id = %transfer.id, "Transfer moved concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        if report.finalized > 0 || report.replaced > 0 {
            info!(
                chain = %side,
                finalized = report.finalized,
                replaced = report.replaced,
                waiting = report.waiting,
                "Tracker pass complete"
            );
        }
        Ok(report)
    }

    async fn track_one(&self, transfer: &Transfer) -> Result<TrackAction> {
        let Some(hash) = transfer.dest_tx_hash else {
            return self.resolve_missing(transfer, "no destination transaction recorded").await;
        };

        match self.connector.tx_status(hash).await? {
            TxStatus::Included {
                block,
                success: true,
            } => {
                let height = self.connector.current_height().await?;
                let depth = height.saturating_sub(block);
                if depth >= self.config.required_confirmations {
                    self.machine
                        .finalize(&transfer.id, Some(depth), "destination transaction final")
                        .await?;
                    return Ok(TrackAction::Finalized);
                }
                if depth != transfer.confirmations {
                    self.machine
                        .record_destination_depth(&transfer.id, depth)
                        .await?;
                }
                Ok(TrackAction::Waiting)
            }
            TxStatus::Included {
                success: false, ..
            } => self.resolve_missing(transfer, "destination transaction reverted").await,
            TxStatus::Pending => Ok(TrackAction::Waiting),
            TxStatus::NotFound => {
                let unknown_for = (Utc::now() - transfer.updated_at)
                    .to_std()
                    .unwrap_or_default();
                if unknown_for < self.config.confirmation_timeout {
                    return Ok(TrackAction::Waiting);
                }
                self.resolve_missing(transfer, "destination transaction dropped").await
            }
        }
    }

    /// Our transaction is gone or reverted: finalize if the key was consumed
    /// anyway, otherwise replace it
    async fn resolve_missing(&self, transfer: &Transfer, reason: &str) -> Result<TrackAction> {
        if self.connector.is_processed(&transfer.id).await? {
            self.machine
                .finalize(&transfer.id, None, "idempotency key consumed on destination")
                .await?;
            return Ok(TrackAction::Finalized);
        }

        let replacing = self.machine.begin_replacement(&transfer.id, reason).await?;
        self.submit_claimed(replacing).await?;
        Ok(TrackAction::Replaced)
    }

    /// Finish `Submitting` transfers left behind by a crash or an aborted pass.
    ///
    /// Submissions for this chain only ever run inside this worker, so any
    /// `Submitting` row seen between passes is orphaned.
    pub async fn resume(&self, reclaimed: Vec<Transfer>) -> Result<usize> {
        let side = self.connector.side();
        let mut resumed = 0;
        for transfer in reclaimed {
            if transfer.dest_chain != side || transfer.state != TransferState::Submitting {
                continue;
            }
            info!(
                transfer_id = %transfer.id,
                dest_tx_hash = ?transfer.dest_tx_hash,
                attempts = transfer.attempts,
                "Resuming interrupted submission"
            );
            match self.submit_claimed(transfer).await {
                Ok(_) => resumed += 1,
                Err(e) if is_stale(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }

    /// One full pass: orphans, tracker, then new claims
    pub async fn poll_once(&self) -> Result<()> {
        let orphans = self.ledger.list_by_state(TransferState::Submitting).await?;
        self.resume(orphans).await?;
        self.track_submitted().await?;
        self.process_confirmed().await?;
        Ok(())
    }

    pub async fn run(self, reclaimed: Vec<Transfer>, cancel: CancellationToken) -> Result<()> {
        let side = self.connector.side();
        let mut breaker = CircuitBreaker::new(self.config.circuit_breaker.clone());

        info!(
            chain = %side,
            name = self.connector.name(),
            required_confirmations = self.config.required_confirmations,
            reclaimed = reclaimed.len(),
            "Submission worker starting"
        );

        if !reclaimed.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.resume(reclaimed) => {
                    if let Err(e) = result {
                        error!(chain = %side, error = %e, "Failed to resume reclaimed transfers");
                    }
                }
            }
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Some(pause) = breaker.check() {
                warn!(
                    chain = %side,
                    pause_secs = pause.as_secs(),
                    "Submission circuit breaker tripped, pausing"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            match result {
                Ok(()) => {
                    if breaker.consecutive_failures() > 0 {
                        info!(chain = %side, "Submission worker recovered");
                    }
                    breaker.record_success();
                    metrics::set_consecutive_failures("worker", side.as_str(), 0);
                }
                Err(e) => {
                    let failures = breaker.record_failure();
                    metrics::set_consecutive_failures("worker", side.as_str(), failures);
                    error!(
                        chain = %side,
                        error = %e,
                        consecutive_failures = failures,
                        "Submission pass failed"
                    );
                }
            }
        }

        info!(chain = %side, "Submission worker stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackAction {
    Finalized,
    Replaced,
    Waiting,
}

fn is_stale(err: &eyre::Report) -> bool {
    err.downcast_ref::<LedgerError>()
        .map(LedgerError::is_stale)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ChainConnector, PreparedTx};
    use crate::ledger::{EventLedger, MemoryLedger};
    use crate::retry::RetryConfig;
    use crate::testing::{sample_event, MockChain};
    use crate::types::{ChainSide, RawEvent, TransferId};
    use alloy::primitives::B256;
    use async_trait::async_trait;

    /// Destination whose gas estimation reverts with "already processed"
    /// after our `processedTransfers` check passed. With `consume_key` another
    /// relayer really did land the call in between; without it the revert
    /// is followed by an unreachable node.
    struct RacedDestination {
        chain: Arc<MockChain>,
        consume_key: bool,
    }

    #[async_trait]
    impl ChainConnector for RacedDestination {
        fn side(&self) -> ChainSide {
            self.chain.side()
        }

        fn chain_id(&self) -> u64 {
            self.chain.chain_id()
        }

        fn name(&self) -> &str {
            self.chain.name()
        }

        async fn current_height(&self) -> Result<u64> {
            self.chain.current_height().await
        }

        async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
            self.chain.block_hash(height).await
        }

        async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>> {
            self.chain.fetch_events(from, to).await
        }

        async fn prepare(&self, call: &DestinationCall) -> Result<PreparedTx, SubmitError> {
            if self.consume_key {
                self.chain.mark_processed(call.idempotency_key);
            } else {
                self.chain.fail_next_reads(1);
            }
            Err(SubmitError::from_message(
                "execution reverted: transfer already processed",
            ))
        }

        async fn broadcast(&self, tx: &PreparedTx) -> Result<PendingSubmission, SubmitError> {
            self.chain.broadcast(tx).await
        }

        async fn tx_status(&self, hash: B256) -> Result<TxStatus> {
            self.chain.tx_status(hash).await
        }

        async fn is_processed(&self, key: &TransferId) -> Result<bool> {
            self.chain.is_processed(key).await
        }
    }

    fn setup(max_attempts: u32) -> (Arc<MockChain>, Arc<MemoryLedger>, SubmissionWorker) {
        setup_with_timeout(max_attempts, Duration::from_millis(30))
    }

    fn setup_with_timeout(
        max_attempts: u32,
        confirmation_timeout: Duration,
    ) -> (Arc<MockChain>, Arc<MemoryLedger>, SubmissionWorker) {
        let chain = Arc::new(MockChain::for_side(ChainSide::B));
        let ledger = Arc::new(MemoryLedger::new());
        let retry = RetryConfig {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        };
        let machine = TransferStateMachine::new(ledger.clone(), retry);
        let worker = SubmissionWorker::new(
            chain.clone(),
            machine,
            WorkerConfig {
                required_confirmations: 3,
                confirmation_timeout,
                poll_interval: Duration::from_millis(5),
                circuit_breaker: CircuitBreakerConfig::default(),
            },
        );
        (chain, ledger, worker)
    }

    /// A `Confirmed` transfer from chain A, so its destination is B
    async fn confirmed(ledger: &MemoryLedger) -> Transfer {
        let mut transfer = Transfer::from_event(&sample_event(ChainSide::A, 100, 2));
        transfer.state = TransferState::Confirmed;
        ledger.insert_if_absent(&transfer).await.unwrap();
        transfer
    }

    #[tokio::test]
    async fn test_submit_then_finalize_at_depth() {
        let (chain, ledger, worker) = setup(5);
        chain.mine_to(49);
        chain.set_auto_mine(true);
        let transfer = confirmed(&ledger).await;

        let outcomes = worker.process_confirmed().await.unwrap();
        assert!(matches!(outcomes.as_slice(), [SubmissionOutcome::Submitted(_)]));
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
        assert!(stored.dest_tx_hash.is_some());

        chain.mine_to(52);
        assert_eq!(worker.track_submitted().await.unwrap().finalized, 0);
        chain.mine_to(53);
        assert_eq!(worker.track_submitted().await.unwrap().finalized, 1);
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Finalized);
        assert_eq!(chain.successful_calls(&transfer.id), 1);
    }

    #[tokio::test]
    async fn test_consumed_key_is_never_broadcast() {
        let (chain, ledger, worker) = setup(5);
        let transfer = confirmed(&ledger).await;
        chain.mark_processed(transfer.id);

        let outcomes = worker.process_confirmed().await.unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [SubmissionOutcome::AlreadyProcessed(t)] if t.state == TransferState::Finalized
        ));
        assert_eq!(chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_backs_off_then_fails_when_exhausted() {
        let (chain, ledger, worker) = setup(2);
        let transfer = confirmed(&ledger).await;
        chain.fail_next_broadcast(SubmitError::Transient("connection reset".to_string()));
        chain.fail_next_broadcast(SubmitError::Transient("connection reset".to_string()));

        let first = worker.process_confirmed().await.unwrap();
        assert!(matches!(first.as_slice(), [SubmissionOutcome::Retrying(_)]));
        let second = worker.process_confirmed().await.unwrap();
        assert!(matches!(second.as_slice(), [SubmissionOutcome::Failed(_)]));

        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
        assert_eq!(stored.attempts, 2);
        assert_eq!(chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_retry() {
        let (chain, ledger, worker) = setup(5);
        let transfer = confirmed(&ledger).await;
        chain.fail_next_broadcast(SubmitError::Permanent("AccessControl: missing role".to_string()));

        worker.process_confirmed().await.unwrap();
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Failed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_replaced() {
        let (chain, ledger, worker) = setup(5);
        let transfer = confirmed(&ledger).await;

        worker.process_confirmed().await.unwrap();
        let first_hash = ledger
            .get(&transfer.id)
            .await
            .unwrap()
            .unwrap()
            .dest_tx_hash
            .unwrap();
        assert_eq!(chain.drop_pending(), vec![first_hash]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        chain.set_auto_mine(true);
        assert_eq!(worker.track_submitted().await.unwrap().replaced, 1);

        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
        assert_eq!(stored.attempts, 2);
        assert_ne!(stored.dest_tx_hash, Some(first_hash));

        chain.mine(3);
        worker.track_submitted().await.unwrap();
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Finalized);
        assert_eq!(chain.successful_calls(&transfer.id), 1);
    }

    #[tokio::test]
    async fn test_unknown_transaction_waits_out_grace_period() {
        let (chain, ledger, worker) = setup_with_timeout(5, Duration::from_secs(60));
        let mut transfer = Transfer::from_event(&sample_event(ChainSide::A, 100, 2));
        transfer.state = TransferState::Submitted;
        transfer.attempts = 1;
        transfer.dest_tx_hash = Some(alloy::primitives::B256::repeat_byte(0xab));
        ledger.insert_if_absent(&transfer).await.unwrap();

        let report = worker.track_submitted().await.unwrap();
        assert_eq!(report.waiting, 1);
        assert_eq!(chain.broadcast_count(), 0);
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
    }

    #[tokio::test]
    async fn test_resume_adopts_in_flight_transaction() {
        let (chain, ledger, worker) = setup(5);
        let transfer = confirmed(&ledger).await;
        let machine = TransferStateMachine::new(ledger.clone(), RetryConfig::default());

        // crash after broadcast, before the Submitted transition was recorded
        let claimed = machine.claim(&transfer.id).await.unwrap();
        let call = DestinationCall::for_transfer(&claimed);
        let prepared = chain.prepare(&call).await.unwrap();
        machine.record_prepared(&claimed.id, prepared.hash).await.unwrap();
        chain.broadcast(&prepared).await.unwrap();

        let orphan = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(worker.resume(vec![orphan]).await.unwrap(), 1);

        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Submitted);
        assert_eq!(stored.dest_tx_hash, Some(prepared.hash));
        assert_eq!(chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_reverted_transaction_finalizes_when_key_consumed() {
        let (chain, ledger, worker) = setup(5);
        let transfer = confirmed(&ledger).await;
        worker.process_confirmed().await.unwrap();

        // another instance lands the mint first; ours reverts on inclusion
        chain.mark_processed(transfer.id);
        chain.mine(4);

        let report = worker.track_submitted().await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(report.replaced, 0);
        assert_eq!(chain.broadcast_count(), 1);
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Finalized);
    }

    fn raced_worker(
        chain: Arc<MockChain>,
        ledger: Arc<MemoryLedger>,
        consume_key: bool,
    ) -> SubmissionWorker {
        let machine = TransferStateMachine::new(ledger, RetryConfig::default());
        SubmissionWorker::new(
            Arc::new(RacedDestination { chain, consume_key }),
            machine,
            WorkerConfig {
                required_confirmations: 3,
                confirmation_timeout: Duration::from_millis(30),
                poll_interval: Duration::from_millis(5),
                circuit_breaker: CircuitBreakerConfig::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_key_consumed_during_submission_finalizes() {
        let (chain, ledger, _) = setup(5);
        let transfer = confirmed(&ledger).await;
        let worker = raced_worker(chain.clone(), ledger.clone(), true);

        let outcomes = worker.process_confirmed().await.unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [SubmissionOutcome::AlreadyProcessed(t)] if t.state == TransferState::Finalized
        ));
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Finalized);
        assert_eq!(stored.attempts, 1);
        assert_eq!(chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_with_unreadable_destination_is_retried() {
        let (chain, ledger, _) = setup(5);
        let transfer = confirmed(&ledger).await;
        let worker = raced_worker(chain.clone(), ledger.clone(), false);

        let outcomes = worker.process_confirmed().await.unwrap();
        assert!(matches!(outcomes.as_slice(), [SubmissionOutcome::Retrying(_)]));
        let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::Confirmed);
        assert!(stored
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("already processed")));
    }
}
