use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::types::{ChainSide, Transfer, TransferId, TransferState, TransitionRecord};

// Amounts are NUMERIC(78,0). Inserts cast bound text with $n::NUMERIC and
// selects read them back through amount::TEXT, so no bigdecimal mapping is needed.

/// Raw `transfers` row
#[derive(Debug, Clone, FromRow)]
pub struct TransferRow {
    pub id: Vec<u8>,
    pub source_chain: String,
    pub dest_chain: String,
    pub source_chain_id: i64,
    pub source_tx_hash: String,
    pub log_index: i64,
    pub observed_block: i64,
    pub observed_block_hash: String,
    pub user_address: String,
    pub amount: String,
    pub target_chain_label: String,
    pub advisory_tx_hash: String,
    pub confirmations: i64,
    pub state: String,
    pub dest_tx_hash: Option<String>,
    pub attempts: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub needs_review: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw `transfer_transitions` row
#[derive(Debug, Clone, FromRow)]
pub struct TransitionRow {
    pub transfer_id: Vec<u8>,
    pub from_state: Option<String>,
    pub to_state: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Raw `chain_cursors` row
#[derive(Debug, Clone, FromRow)]
pub struct CursorRow {
    pub chain: String,
    pub last_processed_block: i64,
}

fn corrupt(field: &str, value: impl std::fmt::Display) -> LedgerError {
    LedgerError::Corrupt(format!("{}: {}", field, value))
}

fn parse_b256(field: &str, value: &str) -> Result<B256, LedgerError> {
    B256::from_str(value).map_err(|e| corrupt(field, e))
}

fn to_u64(field: &str, value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| corrupt(field, value))
}

pub fn parse_state(value: &str) -> Result<TransferState, LedgerError> {
    TransferState::from_str(value).map_err(|e| corrupt("state", e))
}

pub fn parse_side(value: &str) -> Result<ChainSide, LedgerError> {
    ChainSide::from_str(value).map_err(|e| corrupt("chain", e))
}

impl TryFrom<TransferRow> for Transfer {
    type Error = LedgerError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        Ok(Transfer {
            id: TransferId::from_slice(&row.id).map_err(|e| corrupt("id", e))?,
            source_chain: parse_side(&row.source_chain)?,
            dest_chain: parse_side(&row.dest_chain)?,
            source_chain_id: to_u64("source_chain_id", row.source_chain_id)?,
            source_tx_hash: parse_b256("source_tx_hash", &row.source_tx_hash)?,
            log_index: to_u64("log_index", row.log_index)?,
            observed_at_block: to_u64("observed_block", row.observed_block)?,
            observed_block_hash: parse_b256("observed_block_hash", &row.observed_block_hash)?,
            user: Address::from_str(&row.user_address).map_err(|e| corrupt("user_address", e))?,
            amount: U256::from_str(&row.amount).map_err(|e| corrupt("amount", e))?,
            target_chain: row.target_chain_label,
            advisory_tx_hash: parse_b256("advisory_tx_hash", &row.advisory_tx_hash)?,
            confirmations: to_u64("confirmations", row.confirmations)?,
            state: parse_state(&row.state)?,
            dest_tx_hash: row
                .dest_tx_hash
                .as_deref()
                .map(|h| parse_b256("dest_tx_hash", h))
                .transpose()?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("attempts", row.attempts))?,
            retry_after: row.retry_after,
            last_error: row.last_error,
            needs_review: row.needs_review,
            review_reason: row.review_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<TransitionRow> for TransitionRecord {
    type Error = LedgerError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(TransitionRecord {
            transfer_id: TransferId::from_slice(&row.transfer_id)
                .map_err(|e| corrupt("transfer_id", e))?,
            from: row.from_state.as_deref().map(parse_state).transpose()?,
            to: parse_state(&row.to_state)?,
            reason: row.reason,
            at: row.created_at,
        })
    }
}

/// Lowercase 0x hex, the stored form of hashes and addresses
pub fn hex_b256(value: &B256) -> String {
    format!("0x{:x}", value)
}

pub fn hex_address(value: &Address) -> String {
    format!("0x{}", hex::encode(value.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> TransferRow {
        let now = Utc::now();
        TransferRow {
            id: vec![7u8; 32],
            source_chain: "a".to_string(),
            dest_chain: "b".to_string(),
            source_chain_id: 11155111,
            source_tx_hash: hex_b256(&B256::repeat_byte(1)),
            log_index: 2,
            observed_block: 100,
            observed_block_hash: hex_b256(&B256::repeat_byte(3)),
            user_address: hex_address(&Address::repeat_byte(4)),
            amount: "115792089237316195423570985008687907853269984665640564039457584007913129639935"
                .to_string(),
            target_chain_label: "Mumbai".to_string(),
            advisory_tx_hash: hex_b256(&B256::ZERO),
            confirmations: 5,
            state: "confirmed".to_string(),
            dest_tx_hash: None,
            attempts: 0,
            retry_after: None,
            last_error: None,
            needs_review: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_conversion() {
        let transfer = Transfer::try_from(row()).unwrap();
        assert_eq!(transfer.source_chain, ChainSide::A);
        assert_eq!(transfer.state, TransferState::Confirmed);
        assert_eq!(transfer.amount, U256::MAX);
        assert_eq!(transfer.user, Address::repeat_byte(4));
        assert_eq!(transfer.observed_at_block, 100);
    }

    #[test]
    fn test_corrupt_rows_rejected() {
        let mut bad = row();
        bad.state = "pending".to_string();
        assert!(matches!(
            Transfer::try_from(bad),
            Err(LedgerError::Corrupt(_))
        ));

        let mut bad = row();
        bad.id = vec![1, 2, 3];
        assert!(Transfer::try_from(bad).is_err());

        let mut bad = row();
        bad.observed_block = -1;
        assert!(Transfer::try_from(bad).is_err());
    }

    #[test]
    fn test_hex_forms() {
        assert_eq!(hex_b256(&B256::ZERO).len(), 66);
        assert_eq!(
            hex_address(&Address::repeat_byte(0xab)),
            format!("0x{}", "ab".repeat(20))
        );
    }
}
