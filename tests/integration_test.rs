//! Integration tests for the Postgres ledger and the status API
//!
//! Run with: cargo test --test integration_test -- --include-ignored --nocapture
//!
//! The ledger tests need a PostgreSQL instance reachable through DATABASE_URL.
//! The API tests bind an ephemeral local port and run on the in-memory ledger.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::ledger::{EventLedger, MemoryLedger, SharedLedger};
use bridge_relayer::retry::RetryConfig;
use bridge_relayer::state_machine::TransferStateMachine;
use bridge_relayer::testing::sample_event;
use bridge_relayer::types::{ChainSide, RawEvent, StatePatch, Transfer, TransferState};
use bridge_relayer::LedgerError;

mod helpers {
    use bridge_relayer::db;
    use bridge_relayer::ledger::PgLedger;

    pub fn database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    /// Connect and migrate; `None` when DATABASE_URL is not set
    pub async fn pg_ledger() -> Option<PgLedger> {
        let url = database_url()?;
        let pool = db::create_pool(&url).await.expect("Failed to connect to database");
        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        Some(PgLedger::new(pool))
    }
}

/// Event with an id no earlier run has used
fn unique_event(side: ChainSide) -> RawEvent {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    sample_event(side, nanos % 1_000_000_000_000, nanos % 1_000)
}

// ============================================================================
// Postgres ledger (requires DATABASE_URL)
// ============================================================================

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_pg_insert_is_idempotent() {
    let Some(ledger) = helpers::pg_ledger().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let event = unique_event(ChainSide::A);
    let transfer = Transfer::from_event(&event);

    assert!(ledger.insert_if_absent(&transfer).await.unwrap());
    assert!(!ledger.insert_if_absent(&transfer).await.unwrap());

    let stored = ledger.get(&transfer.id).await.unwrap().unwrap();
    assert_eq!(stored.id, transfer.id);
    assert_eq!(stored.state, TransferState::Observed);
    assert_eq!(stored.amount, transfer.amount);
    assert_eq!(stored.observed_block_hash, transfer.observed_block_hash);
    assert_eq!(stored.dest_chain, ChainSide::B);

    let history = ledger.history(&transfer.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, None);
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_pg_transition_is_compare_and_swap() {
    let Some(ledger) = helpers::pg_ledger().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let transfer = Transfer::from_event(&unique_event(ChainSide::B));
    ledger.insert_if_absent(&transfer).await.unwrap();

    let confirmed = ledger
        .update_state(
            &transfer.id,
            TransferState::Observed,
            TransferState::Confirmed,
            StatePatch {
                confirmations: Some(12),
                ..StatePatch::reason("test")
            },
        )
        .await
        .unwrap();
    assert_eq!(confirmed.state, TransferState::Confirmed);
    assert_eq!(confirmed.confirmations, 12);

    // a second writer still believing the transfer is Observed loses
    let err = ledger
        .update_state(
            &transfer.id,
            TransferState::Observed,
            TransferState::Confirmed,
            StatePatch::default(),
        )
        .await
        .unwrap_err();
    assert!(err.is_stale());

    let err = ledger
        .update_state(
            &transfer.id,
            TransferState::Confirmed,
            TransferState::Finalized,
            StatePatch::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_pg_failed_transfer_requeue() {
    let Some(ledger) = helpers::pg_ledger().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let ledger: SharedLedger = Arc::new(ledger);
    let machine = TransferStateMachine::new(ledger.clone(), RetryConfig::default());
    let transfer = Transfer::from_event(&unique_event(ChainSide::A));
    ledger.insert_if_absent(&transfer).await.unwrap();
    machine
        .refresh_confirmations(&transfer, transfer.observed_at_block + 20, 12)
        .await
        .unwrap();

    let claimed = machine.claim(&transfer.id).await.unwrap();
    assert_eq!(claimed.attempts, 1);
    machine.fail(&transfer.id, "execution reverted").await.unwrap();

    let requeued = machine.requeue(&transfer.id).await.unwrap();
    assert_eq!(requeued.state, TransferState::Confirmed);
    assert_eq!(requeued.attempts, 0);

    // only Failed transfers can be requeued
    assert!(machine.requeue(&transfer.id).await.is_err());
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_pg_review_flags() {
    let Some(ledger) = helpers::pg_ledger().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let transfer = Transfer::from_event(&unique_event(ChainSide::A));
    ledger.insert_if_absent(&transfer).await.unwrap();

    ledger
        .flag_for_review(&transfer.id, "source event missing")
        .await
        .unwrap();
    let flagged = ledger.get(&transfer.id).await.unwrap().unwrap();
    assert!(flagged.needs_review);
    assert_eq!(flagged.review_reason.as_deref(), Some("source event missing"));
    assert!(ledger
        .list_needing_review()
        .await
        .unwrap()
        .iter()
        .any(|t| t.id == transfer.id));

    assert!(ledger.clear_review(&transfer.id).await.unwrap());
    assert!(!ledger.clear_review(&transfer.id).await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (DATABASE_URL)"]
async fn test_pg_cursor_never_moves_backwards() {
    let Some(ledger) = helpers::pg_ledger().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    let base = ledger
        .last_processed_block(ChainSide::B)
        .await
        .unwrap()
        .unwrap_or(0);

    ledger
        .set_last_processed_block(ChainSide::B, base + 10)
        .await
        .unwrap();
    ledger
        .set_last_processed_block(ChainSide::B, base + 5)
        .await
        .unwrap();

    assert_eq!(
        ledger.last_processed_block(ChainSide::B).await.unwrap(),
        Some(base + 10)
    );
}

// ============================================================================
// Status API (in-memory ledger)
// ============================================================================

async fn spawn_api(ledger: SharedLedger) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let base = format!("http://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move { api::serve(listener, AppState::new(ledger), c).await });
    (base, cancel)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_api_readiness_follows_cursors() {
    let ledger = Arc::new(MemoryLedger::new());
    let (base, cancel) = spawn_api(ledger.clone()).await;

    let live = client().get(format!("{}/healthz", base)).send().await.unwrap();
    assert_eq!(live.status(), 200);

    let ready = client().get(format!("{}/readyz", base)).send().await.unwrap();
    assert_eq!(ready.status(), 503);

    ledger.set_last_processed_block(ChainSide::A, 10).await.unwrap();
    ledger.set_last_processed_block(ChainSide::B, 20).await.unwrap();
    let ready = client().get(format!("{}/readyz", base)).send().await.unwrap();
    assert_eq!(ready.status(), 200);

    cancel.cancel();
}

#[tokio::test]
async fn test_api_status_and_transfer_lookup() {
    let ledger = Arc::new(MemoryLedger::new());
    let transfer = Transfer::from_event(&sample_event(ChainSide::A, 100, 2));
    ledger.insert_if_absent(&transfer).await.unwrap();
    let (base, cancel) = spawn_api(ledger.clone()).await;

    let status: serde_json::Value = client()
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["transfers"]["observed"], 1);
    assert_eq!(status["transfers"]["finalized"], 0);
    assert_eq!(status["needs_review"], 0);

    let detail = client()
        .get(format!("{}/transfers/{}", base, transfer.id))
        .send()
        .await
        .unwrap();
    assert_eq!(detail.status(), 200);
    let detail: serde_json::Value = detail.json().await.unwrap();
    assert_eq!(detail["transfer"]["state"], "observed");
    assert_eq!(detail["history"].as_array().unwrap().len(), 1);

    let listed: serde_json::Value = client()
        .get(format!("{}/transfers?state=observed", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let missing = client()
        .get(format!("{}/transfers/0x{}", base, "00".repeat(32)))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let malformed = client()
        .get(format!("{}/transfers/not-an-id", base))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);

    let bad_state = client()
        .get(format!("{}/transfers?state=bogus", base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_state.status(), 400);

    cancel.cancel();
}

#[tokio::test]
async fn test_api_exposes_prometheus_metrics() {
    let ledger = Arc::new(MemoryLedger::new());
    let (base, cancel) = spawn_api(ledger).await;

    let response = client().get(format!("{}/metrics", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("bridge_relayer_transfers"));

    cancel.cancel();
}
