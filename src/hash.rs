//! Hash computation for transfer identifiers
//!
//! The transfer id is the idempotency key handed to the destination contract,
//! so it must be stable across restarts, replays and relayer instances.

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// keccak256(abi.encode(uint256 sourceChainId, bytes32 sourceTxHash, uint256 logIndex))
///
/// All values are encoded as 32-byte big-endian words.
pub fn transfer_id(source_chain_id: u64, source_tx_hash: &[u8; 32], log_index: u64) -> [u8; 32] {
    let mut data = [0u8; 96];

    data[24..32].copy_from_slice(&source_chain_id.to_be_bytes());
    data[32..64].copy_from_slice(source_tx_hash);
    data[64 + 24..96].copy_from_slice(&log_index.to_be_bytes());

    keccak256(&data)
}

/// Convert bytes32 to 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};
    use alloy::sol_types::SolValue;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            bytes32_to_hex(&keccak256(b"")),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_transfer_id_matches_abi_encode() {
        let tx_hash = B256::repeat_byte(0x5a);
        let encoded = (U256::from(11155111u64), tx_hash, U256::from(2u64)).abi_encode();
        assert_eq!(encoded.len(), 96);

        let expected = keccak256(&encoded);
        assert_eq!(transfer_id(11155111, &tx_hash.0, 2), expected);
    }

    #[test]
    fn test_transfer_id_distinguishes_inputs() {
        let tx = [0x11u8; 32];
        let base = transfer_id(1, &tx, 0);
        assert_eq!(base, transfer_id(1, &tx, 0));
        assert_ne!(base, transfer_id(1, &tx, 1));
        assert_ne!(base, transfer_id(2, &tx, 0));
        assert_ne!(base, transfer_id(1, &[0x12u8; 32], 0));
    }
}
