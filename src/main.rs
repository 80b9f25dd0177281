//! Bridge relayer binary
//!
//! - bridge-relayer run                 -> run the relayer (default)
//! - bridge-relayer status              -> transfer counts and cursors
//! - bridge-relayer requeue <ID>        -> Failed -> Confirmed
//! - bridge-relayer acknowledge <ID>    -> clear a review flag
//! - bridge-relayer history <ID>        -> transition history of a transfer

use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use bridge_relayer::config::{Config, DatabaseConfig, LogFormat};
use bridge_relayer::connector::{EvmConnector, SharedConnector};
use bridge_relayer::ledger::{EventLedger, PgLedger, SharedLedger};
use bridge_relayer::retry::RetryConfig;
use bridge_relayer::state_machine::TransferStateMachine;
use bridge_relayer::types::{ChainSide, TransferId, TransferState};
use bridge_relayer::{db, Relayer, RelayerSettings};

#[derive(Parser)]
#[command(name = "bridge-relayer")]
#[command(about = "Two-chain bridge relayer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path of the .env file to load
    #[arg(long, global = true, default_value = ".env")]
    env_file: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion, submission, reconciliation and the status API
    Run,

    /// Print transfer counts per state and chain cursors
    Status,

    /// Put a failed transfer back in the submission queue
    Requeue {
        /// Transfer id (0x-prefixed 32-byte hex)
        id: String,
    },

    /// Clear the review flag of a transfer after manual inspection
    Acknowledge { id: String },

    /// Show the recorded state transitions of a transfer
    History { id: String },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.env_file).await,
        Commands::Status => {
            init_logging(LogFormat::Pretty);
            let ledger = open_ledger(&cli.env_file).await?;
            print_status(ledger.as_ref()).await
        }
        Commands::Requeue { id } => {
            init_logging(LogFormat::Pretty);
            let id = parse_id(&id)?;
            let ledger = open_ledger(&cli.env_file).await?;
            let machine = TransferStateMachine::new(ledger, RetryConfig::default());
            let transfer = machine
                .requeue(&id)
                .await
                .wrap_err_with(|| format!("Failed to requeue transfer {}", id))?;
            println!("{} requeued (state: {})", transfer.id, transfer.state);
            Ok(())
        }
        Commands::Acknowledge { id } => {
            init_logging(LogFormat::Pretty);
            let id = parse_id(&id)?;
            let ledger = open_ledger(&cli.env_file).await?;
            let machine = TransferStateMachine::new(ledger, RetryConfig::default());
            if machine.acknowledge(&id).await? {
                println!("{} review flag cleared", id);
            } else {
                println!("{} was not flagged for review", id);
            }
            Ok(())
        }
        Commands::History { id } => {
            init_logging(LogFormat::Pretty);
            let id = parse_id(&id)?;
            let ledger = open_ledger(&cli.env_file).await?;
            let transfer = ledger
                .get(&id)
                .await?
                .ok_or_else(|| eyre!("Transfer {} not found", id))?;
            println!(
                "{} {} -> {} state={} attempts={} dest_tx={}",
                transfer.id,
                transfer.source_chain,
                transfer.dest_chain,
                transfer.state,
                transfer.attempts,
                transfer
                    .dest_tx_hash
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            for record in ledger.history(&id).await? {
                println!(
                    "  {}  {:>10} -> {:<10} {}",
                    record.at.format("%Y-%m-%d %H:%M:%S"),
                    record.from.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                    record.to,
                    record.reason.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

async fn run(env_file: &str) -> Result<()> {
    let config = Config::load_from_file(env_file)?;
    init_logging(config.logging.format);

    tracing::info!("Starting bridge relayer");
    tracing::info!(
        chain_a = %config.chain_a.name,
        chain_a_id = config.chain_a.chain_id,
        chain_b = %config.chain_b.name,
        chain_b_id = config.chain_b.chain_id,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let ledger: SharedLedger = Arc::new(PgLedger::new(pool));
    let retry = config.engine.retry();
    let chain_a: SharedConnector = Arc::new(EvmConnector::new(
        &config.chain_a,
        config.chain_b.name.clone(),
        retry.clone(),
    )?);
    let chain_b: SharedConnector = Arc::new(EvmConnector::new(
        &config.chain_b,
        config.chain_a.name.clone(),
        retry,
    )?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let relayer = Relayer::new(ledger, chain_a, chain_b, RelayerSettings::from_config(&config))?;
    relayer.run(cancel).await?;

    tracing::info!("Bridge relayer stopped");
    Ok(())
}

async fn open_ledger(env_file: &str) -> Result<SharedLedger> {
    let database = DatabaseConfig::load_from_file(env_file)?;
    let pool = db::create_pool(&database.url).await?;
    db::run_migrations(&pool).await?;
    Ok(Arc::new(PgLedger::new(pool)))
}

fn parse_id(raw: &str) -> Result<TransferId> {
    raw.parse::<TransferId>()
        .map_err(|e| eyre!("Invalid transfer id '{}': {}", raw, e))
}

async fn print_status(ledger: &dyn EventLedger) -> Result<()> {
    for side in ChainSide::ALL {
        let cursor = ledger.last_processed_block(side).await?;
        println!(
            "chain {}: last processed block {}",
            side,
            cursor.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    let counts = ledger.count_by_state().await?;
    for state in TransferState::ALL {
        println!("{:>10}: {}", state, counts.get(&state).copied().unwrap_or(0));
    }
    let review = ledger.list_needing_review().await?;
    if !review.is_empty() {
        println!("needs review: {}", review.len());
        for transfer in review {
            println!(
                "  {} ({}) {}",
                transfer.id,
                transfer.state,
                transfer.review_reason.unwrap_or_default()
            );
        }
    }
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init(),
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
