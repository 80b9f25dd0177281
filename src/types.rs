//! Core bridge types
//!
//! Chain sides, the deterministic transfer identifier, the transfer lifecycle
//! states and the `Transfer` row tracked by the event ledger.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

use crate::hash;

// ============================================================================
// Chains
// ============================================================================

/// One of the two bridged chains.
///
/// `A` is the home chain where tokens are locked and later released; `B` is the
/// wrapped chain where tokens are minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    A,
    B,
}

impl ChainSide {
    pub const ALL: [ChainSide; 2] = [ChainSide::A, ChainSide::B];

    /// The chain a transfer observed on `self` is compensated on
    pub fn counterpart(self) -> ChainSide {
        match self {
            ChainSide::A => ChainSide::B,
            ChainSide::B => ChainSide::A,
        }
    }

    /// The compensating call made when a transfer *arrives* on this chain
    pub fn inbound_call(self) -> CompensationKind {
        match self {
            ChainSide::A => CompensationKind::Release,
            ChainSide::B => CompensationKind::Mint,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::A => "a",
            ChainSide::B => "b",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChainSide {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(ChainSide::A),
            "b" => Ok(ChainSide::B),
            other => Err(eyre!("unknown chain side: {}", other)),
        }
    }
}

/// Destination contract method used to compensate a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationKind {
    /// `mintTokens(user, amount, idempotencyKey)` on the wrapped chain
    Mint,
    /// `releaseTokens(user, amount, idempotencyKey)` on the home chain
    Release,
}

impl fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensationKind::Mint => write!(f, "mintTokens"),
            CompensationKind::Release => write!(f, "releaseTokens"),
        }
    }
}

// ============================================================================
// Transfer identity
// ============================================================================

/// Deterministic transfer key derived from (source chain id, source tx hash, log index).
///
/// Doubles as the idempotency key passed to the destination contract. The
/// user-supplied `txHash` event field never feeds into it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub [u8; 32]);

impl TransferId {
    pub fn derive(source_chain_id: u64, source_tx_hash: &B256, log_index: u64) -> Self {
        TransferId(hash::transfer_id(
            source_chain_id,
            &source_tx_hash.0,
            log_index,
        ))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre!("transfer id must be 32 bytes, got {}", bytes.len()))?;
        Ok(TransferId(arr))
    }

    pub fn to_b256(&self) -> B256 {
        B256::from(self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hash::bytes32_to_hex(&self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self)
    }
}

impl FromStr for TransferId {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| eyre!("invalid transfer id {}: {}", s, e))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for TransferId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Transfer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Observed,
    Confirmed,
    Submitting,
    Submitted,
    Finalized,
    Reverted,
    Failed,
}

impl TransferState {
    pub const ALL: [TransferState; 7] = [
        TransferState::Observed,
        TransferState::Confirmed,
        TransferState::Submitting,
        TransferState::Submitted,
        TransferState::Finalized,
        TransferState::Reverted,
        TransferState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Observed => "observed",
            TransferState::Confirmed => "confirmed",
            TransferState::Submitting => "submitting",
            TransferState::Submitted => "submitted",
            TransferState::Finalized => "finalized",
            TransferState::Reverted => "reverted",
            TransferState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Finalized | TransferState::Reverted | TransferState::Failed
        )
    }

    /// Whether the engine has (possibly) acted on the destination chain
    pub fn is_acted_upon(&self) -> bool {
        matches!(
            self,
            TransferState::Submitting | TransferState::Submitted | TransferState::Finalized
        )
    }

    /// Edges the engine may take. Operator remediation (`Failed -> Confirmed`)
    /// is deliberately absent and goes through `EventLedger::requeue_failed`.
    pub fn can_transition_to(&self, to: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, to),
            (Observed, Confirmed)
                | (Observed, Reverted)
                | (Confirmed, Submitting)
                | (Confirmed, Reverted)
                | (Confirmed, Observed)
                | (Submitting, Submitted)
                | (Submitting, Confirmed)
                | (Submitting, Failed)
                | (Submitted, Finalized)
                | (Submitted, Submitting)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        TransferState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| eyre!("unknown transfer state: {}", s))
    }
}

// ============================================================================
// Events and transfers
// ============================================================================

/// A decoded `BridgeInitiated` log together with its position in source history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub source: ChainSide,
    pub source_chain_id: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub user: Address,
    pub amount: U256,
    /// `targetChain` event argument (advisory)
    pub target_chain: String,
    /// `txHash` event argument (advisory, user-influenced)
    pub advisory_tx_hash: B256,
}

impl RawEvent {
    pub fn transfer_id(&self) -> TransferId {
        TransferId::derive(self.source_chain_id, &self.tx_hash, self.log_index)
    }
}

/// The central ledger entity: one bridge request and its compensation progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub id: TransferId,
    pub source_chain: ChainSide,
    pub dest_chain: ChainSide,
    pub source_chain_id: u64,
    pub source_tx_hash: B256,
    pub log_index: u64,
    pub observed_at_block: u64,
    pub observed_block_hash: B256,
    pub user: Address,
    pub amount: U256,
    pub target_chain: String,
    pub advisory_tx_hash: B256,
    pub confirmations: u64,
    pub state: TransferState,
    pub dest_tx_hash: Option<B256>,
    pub attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub needs_review: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// A fresh `Observed` transfer for an ingested event
    pub fn from_event(event: &RawEvent) -> Self {
        let now = Utc::now();
        Self {
            id: event.transfer_id(),
            source_chain: event.source,
            dest_chain: event.source.counterpart(),
            source_chain_id: event.source_chain_id,
            source_tx_hash: event.tx_hash,
            log_index: event.log_index,
            observed_at_block: event.block_number,
            observed_block_hash: event.block_hash,
            user: event.user,
            amount: event.amount,
            target_chain: event.target_chain.clone(),
            advisory_tx_hash: event.advisory_tx_hash,
            confirmations: 0,
            state: TransferState::Observed,
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

    pub fn compensation(&self) -> CompensationKind {
        self.dest_chain.inbound_call()
    }

    /// Depth of the observing block at `height`
    pub fn depth_at(&self, height: u64) -> u64 {
        height.saturating_sub(self.observed_at_block)
    }

    /// Whether a retry backoff (if any) has elapsed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map(|t| now >= t).unwrap_or(true)
    }
}

/// Field changes applied together with a state transition
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub dest_tx_hash: Option<B256>,
    pub increment_attempts: bool,
    /// Replaces the stored value; `None` clears any pending backoff
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub confirmations: Option<u64>,
    /// Free-form reason written to the transition history
    pub reason: Option<String>,
}

impl StatePatch {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Same-state amendments, applied with compare-and-swap on the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Amendment {
    Confirmations(u64),
    /// Signed destination transaction hash, persisted before broadcast
    DestTxHash(B256),
    /// The source event moved to another block after a reorg
    Relocate { block: u64, block_hash: B256 },
}

/// One row of the append-only transition history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub transfer_id: TransferId,
    pub from: Option<TransferState>,
    pub to: TransferState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counterpart_and_inbound_call() {
        assert_eq!(ChainSide::A.counterpart(), ChainSide::B);
        assert_eq!(ChainSide::B.counterpart(), ChainSide::A);
        // lock on A is minted on B; burn on B is released on A
        assert_eq!(ChainSide::A.counterpart().inbound_call(), CompensationKind::Mint);
        assert_eq!(
            ChainSide::B.counterpart().inbound_call(),
            CompensationKind::Release
        );
    }

    #[test]
    fn test_state_round_trip_str() {
        for state in TransferState::ALL {
            assert_eq!(state.as_str().parse::<TransferState>().unwrap(), state);
        }
        assert!("pending".parse::<TransferState>().is_err());
    }

    #[test]
    fn test_transition_graph() {
        use TransferState::*;
        assert!(Observed.can_transition_to(Confirmed));
        assert!(Observed.can_transition_to(Reverted));
        assert!(Confirmed.can_transition_to(Submitting));
        assert!(Submitting.can_transition_to(Submitted));
        assert!(Submitting.can_transition_to(Confirmed));
        assert!(Submitting.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Finalized));
        assert!(Submitted.can_transition_to(Submitting));

        // reorg rollback only before acting on the destination chain
        assert!(!Submitting.can_transition_to(Reverted));
        assert!(!Submitted.can_transition_to(Reverted));
        assert!(!Finalized.can_transition_to(Reverted));

        // confirmation depth is a precondition for submission
        assert!(!Observed.can_transition_to(Submitting));
        assert!(!Observed.can_transition_to(Submitted));
        assert!(!Confirmed.can_transition_to(Submitted));

        for terminal in [Finalized, Reverted, Failed] {
            assert!(terminal.is_terminal());
            for to in TransferState::ALL {
                assert!(!terminal.can_transition_to(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn test_transfer_id_display_parse() {
        let id = TransferId::derive(11155111, &B256::repeat_byte(0xab), 2);
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.to_string().starts_with("0x"));
        assert_eq!(id.to_string().len(), 66);
    }

    #[test]
    fn test_transfer_from_event() {
        let event = RawEvent {
            source: ChainSide::B,
            source_chain_id: 80001,
            tx_hash: B256::repeat_byte(1),
            log_index: 3,
            block_number: 42,
            block_hash: B256::repeat_byte(2),
            user: Address::repeat_byte(9),
            amount: U256::from(1000u64),
            target_chain: "Sepolia".to_string(),
            advisory_tx_hash: B256::repeat_byte(7),
        };
        let transfer = Transfer::from_event(&event);
        assert_eq!(transfer.id, event.transfer_id());
        assert_eq!(transfer.dest_chain, ChainSide::A);
        assert_eq!(transfer.compensation(), CompensationKind::Release);
        assert_eq!(transfer.state, TransferState::Observed);
        assert_eq!(transfer.depth_at(47), 5);
        assert_eq!(transfer.depth_at(10), 0);
        assert!(transfer.is_ready(Utc::now()));
    }
}
