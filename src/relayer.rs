//! Relayer orchestration
//!
//! Runs recovery, then one ingestor and one submission worker per chain, the
//! reconciliation scanner and the status API. Returns when cancelled or when
//! any task fails; remaining tasks get a grace period to finish in-flight work.

use eyre::{eyre, Result};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::connector::SharedConnector;
use crate::ingestion::{EventIngestor, IngestorConfig};
use crate::ledger::SharedLedger;
use crate::reconciliation::{ReconcilerConfig, ReconciliationScanner, ScanTarget};
use crate::recovery::{recover, RecoveryReport};
use crate::retry::{CircuitBreakerConfig, RetryConfig};
use crate::state_machine::TransferStateMachine;
use crate::types::ChainSide;
use crate::worker::{SubmissionWorker, WorkerConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub required_confirmations: u64,
    pub start_block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RelayerSettings {
    pub chain_a: ChainSettings,
    pub chain_b: ChainSettings,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
    pub max_block_range: u64,
    pub reconcile_lookback_blocks: u64,
    pub reconcile_interval: Duration,
    /// Status API bind address and port; `None` disables the API
    pub api: Option<(String, u16)>,
}

impl RelayerSettings {
    pub fn from_config(config: &Config) -> Self {
        let chain = |side| {
            let c = config.chain(side);
            ChainSettings {
                required_confirmations: c.required_confirmations,
                start_block: c.start_block,
            }
        };
        Self {
            chain_a: chain(ChainSide::A),
            chain_b: chain(ChainSide::B),
            retry: config.engine.retry(),
            circuit_breaker: config.engine.circuit_breaker(),
            poll_interval: config.engine.poll_interval(),
            confirmation_timeout: config.engine.confirmation_timeout(),
            max_block_range: config.engine.max_block_range,
            reconcile_lookback_blocks: config.engine.reconcile_lookback_blocks,
            reconcile_interval: config.engine.reconcile_interval(),
            api: Some((config.api.bind_address.clone(), config.api.port)),
        }
    }

    pub fn chain(&self, side: ChainSide) -> &ChainSettings {
        match side {
            ChainSide::A => &self.chain_a,
            ChainSide::B => &self.chain_b,
        }
    }
}

pub struct Relayer {
    ledger: SharedLedger,
    chain_a: SharedConnector,
    chain_b: SharedConnector,
    settings: RelayerSettings,
}

impl Relayer {
    pub fn new(
        ledger: SharedLedger,
        chain_a: SharedConnector,
        chain_b: SharedConnector,
        settings: RelayerSettings,
    ) -> Result<Self> {
        if chain_a.side() != ChainSide::A || chain_b.side() != ChainSide::B {
            return Err(eyre!(
                "Connectors are wired to the wrong sides: got {} and {}",
                chain_a.side(),
                chain_b.side()
            ));
        }
        Ok(Self {
            ledger,
            chain_a,
            chain_b,
            settings,
        })
    }

    fn connector(&self, side: ChainSide) -> SharedConnector {
        match side {
            ChainSide::A => self.chain_a.clone(),
            ChainSide::B => self.chain_b.clone(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let report = recover(self.ledger.as_ref()).await?;
        let machine = TransferStateMachine::new(self.ledger.clone(), self.settings.retry.clone());

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        self.spawn_chain_tasks(&mut tasks, &machine, &report, &cancel);

        let scanner = ReconciliationScanner::new(
            ChainSide::ALL
                .into_iter()
                .map(|side| ScanTarget {
                    connector: self.connector(side),
                    required_confirmations: self.settings.chain(side).required_confirmations,
                })
                .collect(),
            machine.clone(),
            ReconcilerConfig {
                lookback_blocks: self.settings.reconcile_lookback_blocks,
                max_block_range: self.settings.max_block_range,
                interval: self.settings.reconcile_interval,
            },
        );
        let c = cancel.clone();
        tasks.spawn(async move { ("reconciliation".to_string(), scanner.run(c).await) });

        if let Some((bind_address, port)) = self.settings.api.clone() {
            let state = AppState::new(self.ledger.clone());
            let c = cancel.clone();
            tasks.spawn(async move {
                (
                    "api".to_string(),
                    api::start_server(&bind_address, port, state, c).await,
                )
            });
        }

        info!(tasks = tasks.len(), "Relayer running");

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown signal received, stopping relayer");
                Ok(())
            }
            done = tasks.join_next() => match done {
                Some(Ok((name, Ok(())))) => {
                    error!(task = %name, "A relayer task exited unexpectedly without error");
                    Err(eyre!("task {} exited unexpectedly", name))
                }
                Some(Ok((name, Err(e)))) => {
                    error!(task = %name, error = ?e, "A relayer task stopped with error");
                    Err(e.wrap_err(format!("task {} failed", name)))
                }
                Some(Err(e)) => {
                    error!(error = ?e, "A relayer task panicked");
                    Err(eyre!("relayer task panicked: {}", e))
                }
                None => Err(eyre!("no relayer tasks were started")),
            }
        };

        cancel.cancel();
        drain(&mut tasks).await;
        info!("Relayer stopped");
        result
    }

    fn spawn_chain_tasks(
        &self,
        tasks: &mut JoinSet<(String, Result<()>)>,
        machine: &TransferStateMachine,
        report: &RecoveryReport,
        cancel: &CancellationToken,
    ) {
        for side in ChainSide::ALL {
            let chain = self.settings.chain(side);
            let connector = self.connector(side);

            let ingestor = EventIngestor::new(
                connector.clone(),
                machine.clone(),
                IngestorConfig {
                    required_confirmations: chain.required_confirmations,
                    poll_interval: self.settings.poll_interval,
                    max_block_range: self.settings.max_block_range,
                    start_block: chain.start_block,
                    retry: self.settings.retry.clone(),
                    circuit_breaker: self.settings.circuit_breaker.clone(),
                },
            );
            let c = cancel.clone();
            tasks.spawn(async move { (format!("ingestion-{}", side), ingestor.run(c).await) });

            // destination-side settings: this chain receives the compensating calls
            let worker = SubmissionWorker::new(
                connector,
                machine.clone(),
                WorkerConfig {
                    required_confirmations: chain.required_confirmations,
                    confirmation_timeout: self.settings.confirmation_timeout,
                    poll_interval: self.settings.poll_interval,
                    circuit_breaker: self.settings.circuit_breaker.clone(),
                },
            );
            let reclaimed = report.reclaimed_for(side);
            let c = cancel.clone();
            tasks.spawn(async move {
                (
                    format!("worker-{}", side),
                    worker.run(reclaimed, c).await,
                )
            });
        }
    }
}

async fn drain(tasks: &mut JoinSet<(String, Result<()>)>) {
    let wait_all = async {
        while let Some(done) = tasks.join_next().await {
            match done {
                Ok((name, Err(e))) => warn!(task = %name, error = %e, "Task ended with error during shutdown"),
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "Task panicked during shutdown"),
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, wait_all).await.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Tasks did not stop in time, aborting"
        );
        tasks.abort_all();
    }
}
