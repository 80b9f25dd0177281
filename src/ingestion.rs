//! Source-chain ingestion
//!
//! Subscribes to one chain from its persisted cursor, records every
//! `BridgeInitiated` event in the ledger, advances the cursor only after the
//! batch is durable and promotes `Observed` transfers as the head moves.

use eyre::{Result, WrapErr};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::{subscribe, EventBatch, SharedConnector, SubscribeOptions};
use crate::ledger::SharedLedger;
use crate::metrics;
use crate::retry::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use crate::state_machine::{Observation, TransferStateMachine};
use crate::types::TransferState;

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub required_confirmations: u64,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    /// First block to scan when no cursor exists. Defaults to the current head.
    pub start_block: Option<u64>,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Outcome of applying one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub confirmed: usize,
}

pub struct EventIngestor {
    connector: SharedConnector,
    ledger: SharedLedger,
    machine: TransferStateMachine,
    config: IngestorConfig,
}

impl EventIngestor {
    pub fn new(
        connector: SharedConnector,
        machine: TransferStateMachine,
        config: IngestorConfig,
    ) -> Self {
        Self {
            connector,
            ledger: machine.ledger().clone(),
            machine,
            config,
        }
    }

    /// Height the next subscription starts from
    pub async fn resume_height(&self) -> Result<u64> {
        let side = self.connector.side();
        if let Some(last) = self.ledger.last_processed_block(side).await? {
            return Ok(last + 1);
        }
        match self.config.start_block {
            Some(start) => Ok(start),
            None => {
                let head = self
                    .connector
                    .current_height()
                    .await
                    .wrap_err("Failed to get chain head for initial cursor")?;
                info!(chain = %side, head, "No cursor persisted, starting at chain head");
                Ok(head)
            }
        }
    }

    /// Record a batch, then refresh confirmations at `batch.to`, then persist
    /// the cursor. A crash at any point replays the batch harmlessly.
    pub async fn apply_batch(&self, batch: &EventBatch) -> Result<BatchOutcome> {
        let side = self.connector.side();
        let mut outcome = BatchOutcome::default();

        for event in &batch.events {
            match self.machine.observe(event).await? {
                Observation::Inserted => outcome.inserted += 1,
                Observation::Duplicate => {
                    debug!(
                        chain = %side,
                        transfer_id = %event.transfer_id(),
                        "Duplicate event ignored"
                    );
                    outcome.duplicates += 1;
                }
            }
        }

        outcome.confirmed = self.promote_confirmed(batch.to).await?;

        self.ledger
            .set_last_processed_block(side, batch.to)
            .await
            .wrap_err("Failed to persist chain cursor")?;
        metrics::record_cursor(side.as_str(), batch.to);
        metrics::record_height(side.as_str(), batch.to);

        if outcome.inserted > 0 || outcome.confirmed > 0 {
            info!(
                chain = %side,
                from_block = batch.from,
                to_block = batch.to,
                inserted = outcome.inserted,
                duplicates = outcome.duplicates,
                confirmed = outcome.confirmed,
                "Processed source blocks"
            );
        }
        Ok(outcome)
    }

    /// Recompute confirmations of this chain's `Observed` transfers at `height`
    pub async fn promote_confirmed(&self, height: u64) -> Result<usize> {
        let side = self.connector.side();
        let mut confirmed = 0;

        for transfer in self.ledger.list_by_state(TransferState::Observed).await? {
            if transfer.source_chain != side {
                continue;
            }
            match self
                .machine
                .refresh_confirmations(&transfer, height, self.config.required_confirmations)
                .await
            {
                Ok(TransferState::Confirmed) => confirmed += 1,
                Ok(_) => {}
                Err(e) if e.is_stale() => {
                    debug!(transfer_id = %transfer.id, "Transfer moved concurrently, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(confirmed)
    }

    /// Run until cancelled, resubscribing from the persisted cursor after errors
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let side = self.connector.side();
        let mut breaker = CircuitBreaker::new(self.config.circuit_breaker.clone());

        info!(
            chain = %side,
            name = self.connector.name(),
            required_confirmations = self.config.required_confirmations,
            "Event ingestor starting"
        );

        loop {
            if let Some(pause) = breaker.check() {
                warn!(
                    chain = %side,
                    pause_secs = pause.as_secs(),
                    "Ingestion circuit breaker tripped, pausing"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.follow(&mut breaker) => result,
            };

            if let Err(e) = result {
                let failures = breaker.record_failure();
                metrics::set_consecutive_failures("ingestion", side.as_str(), failures);
                let backoff = self.config
                    .retry
                    .backoff_for_attempt(failures.saturating_sub(1));
                error!(
                    chain = %side,
                    error = %e,
                    consecutive_failures = failures,
                    next_backoff_secs = backoff.as_secs(),
                    "Ingestion error, resubscribing from cursor after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        info!(chain = %side, "Event ingestor stopped");
        Ok(())
    }

    /// Follow one subscription until it fails
    async fn follow(&self, breaker: &mut CircuitBreaker) -> Result<()> {
        let from = self.resume_height().await?;
        debug!(chain = %self.connector.side(), from_block = from, "Subscribing");

        let stream = subscribe(
            self.connector.clone(),
            from,
            SubscribeOptions {
                poll_interval: self.config.poll_interval,
                max_block_range: self.config.max_block_range,
            },
        );
        futures::pin_mut!(stream);

        while let Some(batch) = stream.next().await {
            let batch = batch?;
            self.apply_batch(&batch).await?;
            breaker.record_success();
            metrics::set_consecutive_failures("ingestion", self.connector.side().as_str(), 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventLedger, MemoryLedger};
    use crate::testing::MockChain;
    use crate::types::ChainSide;
    use alloy::primitives::{Address, U256};
    use std::sync::Arc;

    fn config(start_block: Option<u64>) -> IngestorConfig {
        IngestorConfig {
            required_confirmations: 5,
            poll_interval: Duration::from_millis(5),
            max_block_range: 50,
            start_block,
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    fn setup(start_block: Option<u64>) -> (Arc<MockChain>, Arc<MemoryLedger>, EventIngestor) {
        let chain = Arc::new(MockChain::for_side(ChainSide::A));
        let ledger = Arc::new(MemoryLedger::new());
        let machine = TransferStateMachine::new(ledger.clone(), RetryConfig::default());
        let ingestor = EventIngestor::new(chain.clone(), machine, config(start_block));
        (chain, ledger, ingestor)
    }

    #[tokio::test]
    async fn test_resume_height_prefers_cursor() {
        let (chain, ledger, ingestor) = setup(Some(7));
        chain.mine_to(30);
        assert_eq!(ingestor.resume_height().await.unwrap(), 7);

        ledger.set_last_processed_block(ChainSide::A, 20).await.unwrap();
        assert_eq!(ingestor.resume_height().await.unwrap(), 21);

        let (chain, _, ingestor) = setup(None);
        chain.mine_to(12);
        assert_eq!(ingestor.resume_height().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let (chain, ledger, ingestor) = setup(Some(1));
        let event = chain.emit_transfer(100, 2, Address::repeat_byte(1), U256::from(1000u64));
        let batch = EventBatch {
            from: 90,
            to: 102,
            events: vec![event.clone()],
        };

        let first = ingestor.apply_batch(&batch).await.unwrap();
        assert_eq!(first.inserted, 1);
        let replay = ingestor.apply_batch(&batch).await.unwrap();
        assert_eq!(replay.inserted, 0);
        assert_eq!(replay.duplicates, 1);

        assert_eq!(ledger.all().await.len(), 1);
        assert_eq!(
            ledger.last_processed_block(ChainSide::A).await.unwrap(),
            Some(102)
        );
    }

    #[tokio::test]
    async fn test_confirmation_promotion_on_later_batch() {
        let (chain, ledger, ingestor) = setup(Some(1));
        let event = chain.emit_transfer(100, 2, Address::repeat_byte(1), U256::from(1000u64));
        ingestor
            .apply_batch(&EventBatch {
                from: 100,
                to: 104,
                events: vec![event.clone()],
            })
            .await
            .unwrap();
        let transfer = ledger.get(&event.transfer_id()).await.unwrap().unwrap();
        assert_eq!(transfer.state, TransferState::Observed);
        assert_eq!(transfer.confirmations, 4);

        let outcome = ingestor
            .apply_batch(&EventBatch {
                from: 105,
                to: 105,
                events: vec![],
            })
            .await
            .unwrap();
        assert_eq!(outcome.confirmed, 1);
        let transfer = ledger.get(&event.transfer_id()).await.unwrap().unwrap();
        assert_eq!(transfer.state, TransferState::Confirmed);
    }

    #[tokio::test]
    async fn test_run_recovers_from_rpc_outage() {
        let (chain, ledger, ingestor) = setup(Some(1));
        let event = chain.emit_transfer(3, 0, Address::repeat_byte(1), U256::from(5u64));
        chain.mine_to(10);
        chain.fail_next_reads(2);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingestor.run(cancel.clone()));

        let mut confirmed = false;
        for _ in 0..200 {
            if let Some(t) = ledger.get(&event.transfer_id()).await.unwrap() {
                if t.state == TransferState::Confirmed {
                    confirmed = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(confirmed);
        assert_eq!(
            ledger.last_processed_block(ChainSide::A).await.unwrap(),
            Some(10)
        );
    }
}
