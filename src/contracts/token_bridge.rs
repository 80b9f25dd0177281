//! Token bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings. The same contract
//! shape is deployed on both chains: the home chain uses `releaseTokens`, the
//! wrapped chain uses `mintTokens`.

use alloy::sol;

sol! {
    #[sol(rpc)]
    contract TokenBridge {
        /// Emitted when a user locks (home chain) or burns (wrapped chain) tokens.
        /// `targetChain` and `txHash` are caller-supplied and advisory only.
        event BridgeInitiated(address user, uint256 amount, string targetChain, bytes32 txHash);

        /// Mint wrapped tokens; reverts if `idempotencyKey` was already consumed
        function mintTokens(address user, uint256 amount, bytes32 idempotencyKey) external;

        /// Release locked tokens; reverts if `idempotencyKey` was already consumed
        function releaseTokens(address user, uint256 amount, bytes32 idempotencyKey) external;

        /// Whether `idempotencyKey` has been consumed by a mint or release
        function processedTransfers(bytes32 idempotencyKey) external view returns (bool);
    }
}
