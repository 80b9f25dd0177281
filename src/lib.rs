//! Two-chain bridge relayer
//!
//! Watches `BridgeInitiated` events on both chains, records each one in a
//! durable ledger under a deterministic id, and compensates on the other chain
//! with `mintTokens` / `releaseTokens`, using that id as the destination
//! contract's idempotency key.

pub mod api;
pub mod config;
pub mod connector;
pub mod contracts;
pub mod db;
pub mod error;
pub mod hash;
pub mod ingestion;
pub mod ledger;
pub mod metrics;
pub mod reconciliation;
pub mod recovery;
pub mod relayer;
pub mod retry;
pub mod state_machine;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{LedgerError, SubmitError};
pub use relayer::{Relayer, RelayerSettings};
pub use types::{ChainSide, Transfer, TransferId, TransferState};
