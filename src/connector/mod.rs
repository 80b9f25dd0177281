//! Chain connector abstraction
//!
//! One connector per chain hides RPC details from the engine: event fetching,
//! head tracking, local signing, raw broadcast, receipt lookup and the
//! destination contract's idempotency query.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::Result;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::SubmitError;
use crate::types::{ChainSide, CompensationKind, RawEvent, Transfer, TransferId};

pub mod evm;

pub use evm::EvmConnector;

pub type SharedConnector = Arc<dyn ChainConnector>;

/// Compensating call to make on the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCall {
    pub kind: CompensationKind,
    pub user: Address,
    pub amount: U256,
    pub idempotency_key: TransferId,
    /// 1-indexed submission attempt; replacements pay more gas
    pub attempt: u32,
}

impl DestinationCall {
    pub fn for_transfer(transfer: &Transfer) -> Self {
        Self {
            kind: transfer.compensation(),
            user: transfer.user,
            amount: transfer.amount,
            idempotency_key: transfer.id,
            attempt: transfer.attempts.max(1),
        }
    }
}

/// A locally signed transaction whose hash is known before broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    pub hash: B256,
    pub raw: Bytes,
}

/// Handle to a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSubmission {
    pub chain: ChainSide,
    pub hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not yet mined
    Pending,
    Included { block: u64, success: bool },
    /// Unknown to the node (never received, dropped, or reorged out)
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceiptSummary {
    pub hash: B256,
    pub block: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed(TxReceiptSummary),
    Reverted { block: u64 },
    Dropped,
    TimedOut,
}

/// Events found in `[from, to]`, in chain order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub from: u64,
    pub to: u64,
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub poll_interval: Duration,
    pub max_block_range: u64,
}

#[async_trait]
pub trait ChainConnector: Send + Sync {
    fn side(&self) -> ChainSide;

    fn chain_id(&self) -> u64;

    fn name(&self) -> &str;

    async fn current_height(&self) -> Result<u64>;

    /// Hash of the canonical block at `height`, `None` if the node has not seen it
    async fn block_hash(&self, height: u64) -> Result<Option<B256>>;

    /// `BridgeInitiated` events in the inclusive block range
    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>>;

    /// Build and sign the compensating transaction without sending it
    async fn prepare(&self, call: &DestinationCall) -> Result<PreparedTx, SubmitError>;

    async fn broadcast(&self, tx: &PreparedTx) -> Result<PendingSubmission, SubmitError>;

    async fn tx_status(&self, hash: B256) -> Result<TxStatus>;

    /// Whether the destination contract already consumed `key`
    async fn is_processed(&self, key: &TransferId) -> Result<bool>;
}

/// Lazily poll `connector` for events from `from` onward.
///
/// Batches are yielded in order and never overlap. The stream ends after
/// yielding its first error; callers resubscribe from their persisted cursor.
pub fn subscribe(
    connector: SharedConnector,
    from: u64,
    options: SubscribeOptions,
) -> impl Stream<Item = Result<EventBatch>> + Send {
    struct Cursor {
        next: u64,
        failed: bool,
    }

    let range = options.max_block_range.max(1);
    stream::unfold(
        Cursor {
            next: from,
            failed: false,
        },
        move |mut cursor| {
            let connector = connector.clone();
            let poll_interval = options.poll_interval;
            async move {
                if cursor.failed {
                    return None;
                }
                loop {
                    let height = match connector.current_height().await {
                        Ok(h) => h,
                        Err(e) => {
                            cursor.failed = true;
                            return Some((Err(e), cursor));
                        }
                    };
                    if height < cursor.next {
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }

                    let to = height.min(cursor.next.saturating_add(range - 1));
                    return match connector.fetch_events(cursor.next, to).await {
                        Ok(events) => {
                            let batch = EventBatch {
                                from: cursor.next,
                                to,
                                events,
                            };
                            cursor.next = to + 1;
                            Some((Ok(batch), cursor))
                        }
                        Err(e) => {
                            cursor.failed = true;
                            Some((Err(e), cursor))
                        }
                    };
                }
            }
        },
    )
}

/// Prepare and broadcast in one step
pub async fn submit(
    connector: &dyn ChainConnector,
    call: &DestinationCall,
) -> Result<(PreparedTx, PendingSubmission), SubmitError> {
    let prepared = connector.prepare(call).await?;
    let pending = connector.broadcast(&prepared).await?;
    Ok((prepared, pending))
}

/// Poll until `handle` is `min_confirmations` deep, reverts, or `timeout` elapses.
///
/// `NotFound` is tolerated while waiting (propagation lag); it is reported as
/// `Dropped` only if it is still the last observed status at the deadline.
pub async fn await_confirmation(
    connector: &dyn ChainConnector,
    handle: &PendingSubmission,
    min_confirmations: u64,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ConfirmationOutcome> {
    let deadline = Instant::now() + timeout;
    let mut last = TxStatus::NotFound;

    loop {
        last = match connector.tx_status(handle.hash).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(
                    tx_hash = %handle.hash,
                    chain = %handle.chain,
                    error = %e,
                    "Receipt lookup failed, will retry"
                );
                last
            }
        };

        match last {
            TxStatus::Included {
                block,
                success: false,
            } => return Ok(ConfirmationOutcome::Reverted { block }),
            TxStatus::Included {
                block,
                success: true,
            } => {
                let height = connector.current_height().await?;
                let confirmations = height.saturating_sub(block);
                if confirmations >= min_confirmations {
                    return Ok(ConfirmationOutcome::Confirmed(TxReceiptSummary {
                        hash: handle.hash,
                        block,
                        confirmations,
                    }));
                }
            }
            TxStatus::Pending | TxStatus::NotFound => {}
        }

        if Instant::now() >= deadline {
            return Ok(match last {
                TxStatus::NotFound => ConfirmationOutcome::Dropped,
                _ => ConfirmationOutcome::TimedOut,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use futures::StreamExt;

    fn options() -> SubscribeOptions {
        SubscribeOptions {
            poll_interval: Duration::from_millis(5),
            max_block_range: 10,
        }
    }

    #[tokio::test]
    async fn test_subscribe_chunks_and_orders_batches() {
        let chain = Arc::new(MockChain::new(ChainSide::A, 11155111));
        chain.mine_to(25);
        chain.emit_transfer(3, 0, Address::repeat_byte(1), U256::from(10u64));
        chain.emit_transfer(17, 1, Address::repeat_byte(2), U256::from(20u64));

        let mut stream = Box::pin(subscribe(chain.clone(), 1, options()));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!((first.from, first.to), (1, 10));
        assert_eq!(first.events.len(), 1);

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((second.from, second.to), (11, 20));
        assert_eq!(second.events[0].block_number, 17);

        let third = stream.next().await.unwrap().unwrap();
        assert_eq!((third.from, third.to), (21, 25));
        assert!(third.events.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_ends_after_error() {
        let chain = Arc::new(MockChain::new(ChainSide::A, 1));
        chain.mine_to(5);
        chain.fail_next_reads(1);

        let mut stream = Box::pin(subscribe(chain.clone(), 1, options()));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_await_confirmation_outcomes() {
        let chain = MockChain::new(ChainSide::B, 80001);
        chain.mine_to(49);
        chain.set_auto_mine(true);

        let call = DestinationCall {
            kind: CompensationKind::Mint,
            user: Address::repeat_byte(3),
            amount: U256::from(5u64),
            idempotency_key: TransferId([1u8; 32]),
            attempt: 1,
        };
        let (_, handle) = submit(&chain, &call).await.unwrap();

        let outcome = await_confirmation(
            &chain,
            &handle,
            0,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        match outcome {
            ConfirmationOutcome::Confirmed(receipt) => assert_eq!(receipt.block, 50),
            other => panic!("unexpected outcome {:?}", other),
        }

        let outcome = await_confirmation(
            &chain,
            &handle,
            3,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::TimedOut);

        let missing = PendingSubmission {
            chain: ChainSide::B,
            hash: B256::repeat_byte(0xee),
        };
        let outcome = await_confirmation(
            &chain,
            &missing,
            0,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ConfirmationOutcome::Dropped);
    }
}
