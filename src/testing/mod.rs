//! Test doubles shared by unit and integration tests

use alloy::primitives::{Address, B256, U256};

use crate::types::{ChainSide, RawEvent};

pub mod mock_chain;

pub use mock_chain::MockChain;

/// Chain ids used by the test chains (Sepolia / Mumbai)
pub fn chain_id_for(side: ChainSide) -> u64 {
    match side {
        ChainSide::A => 11155111,
        ChainSide::B => 80001,
    }
}

/// Deterministic block hash for `height` on a given chain fork
pub fn block_hash(side: ChainSide, fork: u64, height: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = match side {
        ChainSide::A => 0xa0,
        ChainSide::B => 0xb0,
    };
    bytes[8..16].copy_from_slice(&fork.to_be_bytes());
    bytes[24..32].copy_from_slice(&height.to_be_bytes());
    B256::from(bytes)
}

/// A standalone event at `block` / `log_index`, not attached to any `MockChain`
pub fn sample_event(side: ChainSide, block: u64, log_index: u64) -> RawEvent {
    let mut tx = [0u8; 32];
    tx[0] = 0x7e;
    tx[16..24].copy_from_slice(&block.to_be_bytes());
    tx[24..32].copy_from_slice(&log_index.to_be_bytes());
    RawEvent {
        source: side,
        source_chain_id: chain_id_for(side),
        tx_hash: B256::from(tx),
        log_index,
        block_number: block,
        block_hash: block_hash(side, 0, block),
        user: Address::repeat_byte(0x42),
        amount: U256::from(1000u64),
        target_chain: side.counterpart().to_string(),
        advisory_tx_hash: B256::ZERO,
    }
}
