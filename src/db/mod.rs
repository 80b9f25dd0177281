//! PostgreSQL access for the event ledger
//!
//! Free functions over a `PgPool`. Every state change is a compare-and-swap on
//! the `state` column and is recorded in `transfer_transitions` within the same
//! database transaction.

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::error;

use crate::error::LedgerError;
use crate::types::{
    Amendment, ChainSide, StatePatch, Transfer, TransferId, TransferState, TransitionRecord,
};

pub mod models;

pub use models::*;

const TRANSFER_COLUMNS: &str = r#"id, source_chain, dest_chain, source_chain_id, source_tx_hash,
    log_index, observed_block, observed_block_hash, user_address, amount::TEXT AS amount,
    target_chain_label, advisory_tx_hash, confirmations, state, dest_tx_hash, attempts,
    retry_after, last_error, needs_review, review_reason, created_at, updated_at"#;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

fn log_sql_error(context: &'static str) -> impl Fn(sqlx::Error) -> LedgerError {
    move |e| {
        error!(error = ?e, "SQL error {}", context);
        LedgerError::Database(e)
    }
}

fn into_transfers(rows: Vec<TransferRow>) -> Result<Vec<Transfer>, LedgerError> {
    rows.into_iter().map(Transfer::try_from).collect()
}

/// Insert an observed transfer unless its id is already present.
/// Returns `true` when a new row was written.
pub async fn insert_transfer_if_absent(
    pool: &PgPool,
    transfer: &Transfer,
) -> Result<bool, LedgerError> {
    let mut tx = pool.begin().await?;

    let inserted: Option<Vec<u8>> = sqlx::query_scalar(
        r#"
        INSERT INTO transfers (id, source_chain, dest_chain, source_chain_id, source_tx_hash,
            log_index, observed_block, observed_block_hash, user_address, amount,
            target_chain_label, advisory_tx_hash, confirmations, state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::NUMERIC, $11, $12, $13, $14)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(transfer.id.as_bytes().as_slice())
    .bind(transfer.source_chain.as_str())
    .bind(transfer.dest_chain.as_str())
    .bind(transfer.source_chain_id as i64)
    .bind(hex_b256(&transfer.source_tx_hash))
    .bind(transfer.log_index as i64)
    .bind(transfer.observed_at_block as i64)
    .bind(hex_b256(&transfer.observed_block_hash))
    .bind(hex_address(&transfer.user))
    .bind(transfer.amount.to_string())
    .bind(&transfer.target_chain)
    .bind(hex_b256(&transfer.advisory_tx_hash))
    .bind(transfer.confirmations as i64)
    .bind(transfer.state.as_str())
    .fetch_optional(&mut *tx)
    .await
    .map_err(log_sql_error("inserting transfer"))?;

    if inserted.is_some() {
        record_transition(&mut tx, &transfer.id, None, transfer.state, Some("observed")).await?;
    }
    tx.commit().await?;

    Ok(inserted.is_some())
}

pub async fn get_transfer(pool: &PgPool, id: &TransferId) -> Result<Option<Transfer>, LedgerError> {
    let sql = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
    let row = sqlx::query_as::<_, TransferRow>(&sql)
        .bind(id.as_bytes().as_slice())
        .fetch_optional(pool)
        .await
        .map_err(log_sql_error("getting transfer"))?;

    row.map(Transfer::try_from).transpose()
}

async fn current_state(
    tx: &mut Transaction<'_, Postgres>,
    id: &TransferId,
) -> Result<Option<TransferState>, LedgerError> {
    let state: Option<String> = sqlx::query_scalar("SELECT state FROM transfers WHERE id = $1")
        .bind(id.as_bytes().as_slice())
        .fetch_optional(&mut **tx)
        .await?;
    state.as_deref().map(parse_state).transpose()
}

/// Explain why a CAS matched no row
async fn cas_miss(
    tx: &mut Transaction<'_, Postgres>,
    id: &TransferId,
    expected: TransferState,
) -> LedgerError {
    match current_state(tx, id).await {
        Ok(Some(actual)) => LedgerError::StaleState {
            id: *id,
            expected,
            actual,
        },
        Ok(None) => LedgerError::NotFound(*id),
        Err(e) => e,
    }
}

async fn record_transition(
    tx: &mut Transaction<'_, Postgres>,
    id: &TransferId,
    from: Option<TransferState>,
    to: TransferState,
    reason: Option<&str>,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO transfer_transitions (transfer_id, from_state, to_state, reason)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id.as_bytes().as_slice())
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(reason)
    .execute(&mut **tx)
    .await
    .map_err(log_sql_error("recording transition"))?;
    Ok(())
}

/// Compare-and-swap `from -> to`, applying `patch` in the same statement
pub async fn transition_transfer(
    pool: &PgPool,
    id: &TransferId,
    from: TransferState,
    to: TransferState,
    patch: &StatePatch,
) -> Result<Transfer, LedgerError> {
    if !from.can_transition_to(to) {
        return Err(LedgerError::InvalidTransition { from, to });
    }

    let mut tx = pool.begin().await?;
    let sql = format!(
        r#"
        UPDATE transfers SET
            state = $3,
            dest_tx_hash = COALESCE($4, dest_tx_hash),
            attempts = attempts + $5,
            retry_after = $6,
            last_error = COALESCE($7, last_error),
            confirmations = COALESCE($8, confirmations),
            updated_at = NOW()
        WHERE id = $1 AND state = $2
        RETURNING {}
        "#,
        TRANSFER_COLUMNS
    );
    let row = sqlx::query_as::<_, TransferRow>(&sql)
        .bind(id.as_bytes().as_slice())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(patch.dest_tx_hash.as_ref().map(hex_b256))
        .bind(if patch.increment_attempts { 1i32 } else { 0i32 })
        .bind(patch.retry_after)
        .bind(patch.last_error.as_deref())
        .bind(patch.confirmations.map(|c| c as i64))
        .fetch_optional(&mut *tx)
        .await
        .map_err(log_sql_error("transitioning transfer"))?;

    let Some(row) = row else {
        return Err(cas_miss(&mut tx, id, from).await);
    };

    record_transition(&mut tx, id, Some(from), to, patch.reason.as_deref()).await?;
    tx.commit().await?;

    Transfer::try_from(row)
}

/// Same-state update guarded by `state`
pub async fn amend_transfer(
    pool: &PgPool,
    id: &TransferId,
    state: TransferState,
    amendment: &Amendment,
) -> Result<Transfer, LedgerError> {
    let mut tx = pool.begin().await?;

    let row = match amendment {
        Amendment::Confirmations(confirmations) => {
            let sql = format!(
                "UPDATE transfers SET confirmations = $3, updated_at = NOW() \
                 WHERE id = $1 AND state = $2 RETURNING {}",
                TRANSFER_COLUMNS
            );
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(id.as_bytes().as_slice())
                .bind(state.as_str())
                .bind(*confirmations as i64)
                .fetch_optional(&mut *tx)
                .await
        }
        Amendment::DestTxHash(hash) => {
            let sql = format!(
                "UPDATE transfers SET dest_tx_hash = $3, updated_at = NOW() \
                 WHERE id = $1 AND state = $2 RETURNING {}",
                TRANSFER_COLUMNS
            );
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(id.as_bytes().as_slice())
                .bind(state.as_str())
                .bind(hex_b256(hash))
                .fetch_optional(&mut *tx)
                .await
        }
        Amendment::Relocate { block, block_hash } => {
            let sql = format!(
                "UPDATE transfers SET observed_block = $3, observed_block_hash = $4, \
                 confirmations = 0, updated_at = NOW() \
                 WHERE id = $1 AND state = $2 RETURNING {}",
                TRANSFER_COLUMNS
            );
            sqlx::query_as::<_, TransferRow>(&sql)
                .bind(id.as_bytes().as_slice())
                .bind(state.as_str())
                .bind(*block as i64)
                .bind(hex_b256(block_hash))
                .fetch_optional(&mut *tx)
                .await
        }
    }
    .map_err(log_sql_error("amending transfer"))?;

    let Some(row) = row else {
        return Err(cas_miss(&mut tx, id, state).await);
    };
    tx.commit().await?;

    Transfer::try_from(row)
}

/// Operator remediation: `Failed -> Confirmed` with a fresh attempt budget
pub async fn requeue_failed_transfer(pool: &PgPool, id: &TransferId) -> Result<Transfer, LedgerError> {
    let mut tx = pool.begin().await?;
    let sql = format!(
        r#"
        UPDATE transfers SET state = 'confirmed', attempts = 0, retry_after = NULL,
            updated_at = NOW()
        WHERE id = $1 AND state = 'failed'
        RETURNING {}
        "#,
        TRANSFER_COLUMNS
    );
    let row = sqlx::query_as::<_, TransferRow>(&sql)
        .bind(id.as_bytes().as_slice())
        .fetch_optional(&mut *tx)
        .await
        .map_err(log_sql_error("requeueing transfer"))?;

    let Some(row) = row else {
        return Err(cas_miss(&mut tx, id, TransferState::Failed).await);
    };

    record_transition(
        &mut tx,
        id,
        Some(TransferState::Failed),
        TransferState::Confirmed,
        Some("operator requeue"),
    )
    .await?;
    tx.commit().await?;

    Transfer::try_from(row)
}

pub async fn list_transfers_by_state(
    pool: &PgPool,
    state: TransferState,
) -> Result<Vec<Transfer>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transfers WHERE state = $1 ORDER BY observed_block, log_index",
        TRANSFER_COLUMNS
    );
    let rows = sqlx::query_as::<_, TransferRow>(&sql)
        .bind(state.as_str())
        .fetch_all(pool)
        .await
        .map_err(log_sql_error("listing transfers by state"))?;

    into_transfers(rows)
}

pub async fn list_transfers_in_source_window(
    pool: &PgPool,
    chain: ChainSide,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<Transfer>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transfers \
         WHERE source_chain = $1 AND observed_block BETWEEN $2 AND $3 \
         ORDER BY observed_block, log_index",
        TRANSFER_COLUMNS
    );
    let rows = sqlx::query_as::<_, TransferRow>(&sql)
        .bind(chain.as_str())
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(pool)
        .await
        .map_err(log_sql_error("listing transfers in source window"))?;

    into_transfers(rows)
}

pub async fn flag_transfer_for_review(
    pool: &PgPool,
    id: &TransferId,
    reason: &str,
) -> Result<(), LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE transfers SET needs_review = TRUE, review_reason = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id.as_bytes().as_slice())
    .bind(reason)
    .execute(pool)
    .await
    .map_err(log_sql_error("flagging transfer"))?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::NotFound(*id));
    }
    Ok(())
}

/// Clear a review flag; returns whether the transfer was flagged
pub async fn clear_transfer_review(pool: &PgPool, id: &TransferId) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE transfers SET needs_review = FALSE, updated_at = NOW()
        WHERE id = $1 AND needs_review
        "#,
    )
    .bind(id.as_bytes().as_slice())
    .execute(pool)
    .await
    .map_err(log_sql_error("clearing review flag"))?;

    if result.rows_affected() == 0 && get_transfer(pool, id).await?.is_none() {
        return Err(LedgerError::NotFound(*id));
    }
    Ok(result.rows_affected() > 0)
}

pub async fn list_transfers_needing_review(pool: &PgPool) -> Result<Vec<Transfer>, LedgerError> {
    let sql = format!(
        "SELECT {} FROM transfers WHERE needs_review ORDER BY updated_at",
        TRANSFER_COLUMNS
    );
    let rows = sqlx::query_as::<_, TransferRow>(&sql)
        .fetch_all(pool)
        .await
        .map_err(log_sql_error("listing transfers needing review"))?;

    into_transfers(rows)
}

pub async fn count_transfers_by_state(
    pool: &PgPool,
) -> Result<Vec<(TransferState, i64)>, LedgerError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT state, COUNT(*) FROM transfers GROUP BY state")
            .fetch_all(pool)
            .await
            .map_err(log_sql_error("counting transfers"))?;

    rows.into_iter()
        .map(|(state, count)| Ok((parse_state(&state)?, count)))
        .collect()
}

pub async fn get_transfer_history(
    pool: &PgPool,
    id: &TransferId,
) -> Result<Vec<TransitionRecord>, LedgerError> {
    let rows = sqlx::query_as::<_, TransitionRow>(
        r#"
        SELECT transfer_id, from_state, to_state, reason, created_at
        FROM transfer_transitions WHERE transfer_id = $1 ORDER BY id
        "#,
    )
    .bind(id.as_bytes().as_slice())
    .fetch_all(pool)
    .await
    .map_err(log_sql_error("getting transfer history"))?;

    rows.into_iter().map(TransitionRecord::try_from).collect()
}

/// Get the last processed block for a chain
pub async fn get_last_processed_block(
    pool: &PgPool,
    chain: ChainSide,
) -> Result<Option<u64>, LedgerError> {
    let row = sqlx::query_as::<_, CursorRow>(
        "SELECT chain, last_processed_block FROM chain_cursors WHERE chain = $1",
    )
    .bind(chain.as_str())
    .fetch_optional(pool)
    .await
    .map_err(log_sql_error("getting chain cursor"))?;

    row.map(|r| {
        u64::try_from(r.last_processed_block)
            .map_err(|_| LedgerError::Corrupt(format!("cursor for {}", r.chain)))
    })
    .transpose()
}

/// Update the last processed block for a chain. Never moves backwards.
pub async fn update_last_processed_block(
    pool: &PgPool,
    chain: ChainSide,
    block: u64,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO chain_cursors (chain, last_processed_block, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (chain) DO UPDATE SET
            last_processed_block = GREATEST(chain_cursors.last_processed_block, EXCLUDED.last_processed_block),
            updated_at = NOW()
        "#,
    )
    .bind(chain.as_str())
    .bind(block as i64)
    .execute(pool)
    .await
    .map_err(log_sql_error("updating chain cursor"))?;
    Ok(())
}
