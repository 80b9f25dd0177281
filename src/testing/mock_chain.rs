//! Scripted in-memory chain
//!
//! Implements `ChainConnector` over a fake chain that tests drive by hand:
//! mine blocks, emit bridge events, reorganize history, drop mempool
//! transactions and inject RPC or submission failures. The destination
//! contract's idempotency rule is modelled: a mint/release whose key was
//! already consumed reverts.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::{block_hash, chain_id_for};
use crate::connector::{ChainConnector, DestinationCall, PendingSubmission, PreparedTx, TxStatus};
use crate::error::SubmitError;
use crate::hash::keccak256;
use crate::types::{ChainSide, RawEvent, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockTxState {
    Pending,
    Included { block: u64, success: bool },
}

#[derive(Debug, Clone)]
struct MockTx {
    call: DestinationCall,
    state: MockTxState,
}

#[derive(Default)]
struct State {
    height: u64,
    /// Fork id per height; heights without an entry are on fork 0
    forks: BTreeMap<u64, u64>,
    next_fork: u64,
    logs: Vec<RawEvent>,
    prepared: HashMap<B256, DestinationCall>,
    txs: HashMap<B256, MockTx>,
    mempool: Vec<B256>,
    processed: HashSet<TransferId>,
    successful_calls: HashMap<TransferId, u32>,
    auto_mine: bool,
    tx_counter: u64,
    broadcasts: u32,
    submit_failures: VecDeque<SubmitError>,
    read_failures: u32,
}

impl State {
    fn hash_at(&self, side: ChainSide, height: u64) -> B256 {
        let fork = self.forks.get(&height).copied().unwrap_or(0);
        block_hash(side, fork, height)
    }

    fn mine_one(&mut self) {
        self.height += 1;
        let block = self.height;
        for hash in std::mem::take(&mut self.mempool) {
            let Some(tx) = self.txs.get_mut(&hash) else {
                continue;
            };
            let key = tx.call.idempotency_key;
            let success = self.processed.insert(key);
            if success {
                *self.successful_calls.entry(key).or_insert(0) += 1;
            }
            tx.state = MockTxState::Included { block, success };
        }
    }

    fn check_read(&mut self) -> Result<()> {
        if self.read_failures > 0 {
            self.read_failures -= 1;
            return Err(eyre!("connection refused (injected)"));
        }
        Ok(())
    }
}

pub struct MockChain {
    side: ChainSide,
    chain_id: u64,
    name: String,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(side: ChainSide, chain_id: u64) -> Self {
        Self {
            side,
            chain_id,
            name: format!("mock-{}", side),
            state: Mutex::new(State::default()),
        }
    }

    /// A chain with the default test chain id for `side`
    pub fn for_side(side: ChainSide) -> Self {
        Self::new(side, chain_id_for(side))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn height(&self) -> u64 {
        self.lock().height
    }

    /// Mine `n` blocks, including any mempool transactions in the first one
    pub fn mine(&self, n: u64) {
        let mut state = self.lock();
        for _ in 0..n {
            state.mine_one();
        }
    }

    pub fn mine_to(&self, height: u64) {
        let mut state = self.lock();
        while state.height < height {
            state.mine_one();
        }
    }

    /// Broadcast transactions are mined into the next block immediately
    pub fn set_auto_mine(&self, enabled: bool) {
        self.lock().auto_mine = enabled;
    }

    /// Emit `BridgeInitiated` at `block` (mining up to it if needed)
    pub fn emit_transfer(&self, block: u64, log_index: u64, user: Address, amount: U256) -> RawEvent {
        let mut state = self.lock();
        while state.height < block {
            state.mine_one();
        }
        state.tx_counter += 1;

        let mut seed = Vec::with_capacity(32);
        seed.extend_from_slice(&self.chain_id.to_be_bytes());
        seed.extend_from_slice(&block.to_be_bytes());
        seed.extend_from_slice(&log_index.to_be_bytes());
        seed.extend_from_slice(&state.tx_counter.to_be_bytes());

        let event = RawEvent {
            source: self.side,
            source_chain_id: self.chain_id,
            tx_hash: B256::from(keccak256(&seed)),
            log_index,
            block_number: block,
            block_hash: state.hash_at(self.side, block),
            user,
            amount,
            target_chain: self.side.counterpart().to_string(),
            advisory_tx_hash: B256::ZERO,
        };
        state.logs.push(event.clone());
        event
    }

    /// Replace history from `from_block` onward with a fork that omits every
    /// bridge event in it. Destination transactions mined in the abandoned
    /// blocks go back to the mempool.
    pub fn reorg(&self, from_block: u64) -> Vec<RawEvent> {
        let mut state = self.lock();
        state.next_fork += 1;
        let fork = state.next_fork;
        for height in from_block..=state.height.max(from_block) {
            state.forks.insert(height, fork);
        }

        let (removed, kept): (Vec<RawEvent>, Vec<RawEvent>) = std::mem::take(&mut state.logs)
            .into_iter()
            .partition(|e| e.block_number >= from_block);
        state.logs = kept;

        let mut reopened = Vec::new();
        for (hash, tx) in state.txs.iter_mut() {
            if let MockTxState::Included { block, success } = tx.state {
                if block >= from_block {
                    reopened.push((*hash, tx.call.idempotency_key, success));
                    tx.state = MockTxState::Pending;
                }
            }
        }
        for (hash, key, success) in reopened {
            if success {
                state.processed.remove(&key);
                if let Some(count) = state.successful_calls.get_mut(&key) {
                    *count -= 1;
                }
            }
            state.mempool.push(hash);
        }
        removed
    }

    /// Move an existing event to another block, as a reorg that re-includes it would
    pub fn relocate_event(&self, event: &RawEvent, new_block: u64) -> Option<RawEvent> {
        let mut state = self.lock();
        while state.height < new_block {
            state.mine_one();
        }
        state.next_fork += 1;
        let fork = state.next_fork;
        state.forks.insert(event.block_number, fork);
        let new_hash = {
            state.forks.insert(new_block, fork);
            state.hash_at(self.side, new_block)
        };

        let log = state
            .logs
            .iter_mut()
            .find(|e| e.tx_hash == event.tx_hash && e.log_index == event.log_index)?;
        log.block_number = new_block;
        log.block_hash = new_hash;
        Some(log.clone())
    }

    /// Evict every pending transaction from the mempool
    pub fn drop_pending(&self) -> Vec<B256> {
        let mut state = self.lock();
        let dropped = std::mem::take(&mut state.mempool);
        for hash in &dropped {
            state.txs.remove(hash);
        }
        dropped
    }

    /// Fail the next broadcast with `error`
    pub fn fail_next_broadcast(&self, error: SubmitError) {
        self.lock().submit_failures.push_back(error);
    }

    /// Fail the next `n` read calls with a connection error
    pub fn fail_next_reads(&self, n: u32) {
        self.lock().read_failures += n;
    }

    /// Consume `key` out-of-band, as another relayer instance would
    pub fn mark_processed(&self, key: TransferId) {
        self.lock().processed.insert(key);
    }

    /// Number of mints/releases for `key` that took effect
    pub fn successful_calls(&self, key: &TransferId) -> u32 {
        self.lock().successful_calls.get(key).copied().unwrap_or(0)
    }

    /// Number of transactions accepted by `broadcast`
    pub fn broadcast_count(&self) -> u32 {
        self.lock().broadcasts
    }

    pub fn pending_count(&self) -> usize {
        self.lock().mempool.len()
    }

    pub fn events(&self) -> Vec<RawEvent> {
        self.lock().logs.clone()
    }
}

#[async_trait]
impl ChainConnector for MockChain {
    fn side(&self) -> ChainSide {
        self.side
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn current_height(&self) -> Result<u64> {
        let mut state = self.lock();
        state.check_read()?;
        Ok(state.height)
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        let mut state = self.lock();
        state.check_read()?;
        if height > state.height {
            return Ok(None);
        }
        Ok(Some(state.hash_at(self.side, height)))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let mut state = self.lock();
        state.check_read()?;
        let mut events: Vec<RawEvent> = state
            .logs
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn prepare(&self, call: &DestinationCall) -> Result<PreparedTx, SubmitError> {
        let mut state = self.lock();
        state.tx_counter += 1;

        let mut seed = Vec::with_capacity(80);
        seed.extend_from_slice(&self.chain_id.to_be_bytes());
        seed.extend_from_slice(&state.tx_counter.to_be_bytes());
        seed.extend_from_slice(call.idempotency_key.as_bytes());
        let hash = B256::from(keccak256(&seed));

        state.prepared.insert(hash, call.clone());
        Ok(PreparedTx {
            hash,
            raw: seed.into(),
        })
    }

    async fn broadcast(&self, tx: &PreparedTx) -> Result<PendingSubmission, SubmitError> {
        let mut state = self.lock();
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }
        let call = state
            .prepared
            .get(&tx.hash)
            .cloned()
            .ok_or_else(|| SubmitError::Permanent("unknown transaction".to_string()))?;

        if !state.txs.contains_key(&tx.hash) {
            state.txs.insert(
                tx.hash,
                MockTx {
                    call,
                    state: MockTxState::Pending,
                },
            );
            state.mempool.push(tx.hash);
            state.broadcasts += 1;
        }
        if state.auto_mine {
            state.mine_one();
        }

        Ok(PendingSubmission {
            chain: self.side,
            hash: tx.hash,
        })
    }

    async fn tx_status(&self, hash: B256) -> Result<TxStatus> {
        let mut state = self.lock();
        state.check_read()?;
        Ok(match state.txs.get(&hash).map(|tx| tx.state) {
            Some(MockTxState::Pending) => TxStatus::Pending,
            Some(MockTxState::Included { block, success }) => TxStatus::Included { block, success },
            None => TxStatus::NotFound,
        })
    }

    async fn is_processed(&self, key: &TransferId) -> Result<bool> {
        let mut state = self.lock();
        state.check_read()?;
        Ok(state.processed.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompensationKind;

    fn call(key: u8) -> DestinationCall {
        DestinationCall {
            kind: CompensationKind::Mint,
            user: Address::repeat_byte(1),
            amount: U256::from(1u64),
            idempotency_key: TransferId([key; 32]),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_second_call_for_same_key_reverts() {
        let chain = MockChain::for_side(ChainSide::B);
        chain.set_auto_mine(true);

        let first = chain.prepare(&call(1)).await.unwrap();
        chain.broadcast(&first).await.unwrap();
        let second = chain.prepare(&call(1)).await.unwrap();
        chain.broadcast(&second).await.unwrap();

        assert_eq!(
            chain.tx_status(first.hash).await.unwrap(),
            TxStatus::Included {
                block: 1,
                success: true
            }
        );
        assert_eq!(
            chain.tx_status(second.hash).await.unwrap(),
            TxStatus::Included {
                block: 2,
                success: false
            }
        );
        assert_eq!(chain.successful_calls(&TransferId([1; 32])), 1);
    }

    #[tokio::test]
    async fn test_reorg_removes_events_and_reopens_txs() {
        let chain = MockChain::for_side(ChainSide::A);
        let event = chain.emit_transfer(10, 0, Address::ZERO, U256::from(5u64));
        chain.mine_to(12);

        let tx = chain.prepare(&call(2)).await.unwrap();
        chain.broadcast(&tx).await.unwrap();
        chain.mine(1);
        assert!(chain.is_processed(&TransferId([2; 32])).await.unwrap());

        let removed = chain.reorg(9);
        assert_eq!(removed, vec![event]);
        assert!(chain.fetch_events(0, 20).await.unwrap().is_empty());
        assert_eq!(chain.tx_status(tx.hash).await.unwrap(), TxStatus::Pending);
        assert!(!chain.is_processed(&TransferId([2; 32])).await.unwrap());

        chain.drop_pending();
        assert_eq!(chain.tx_status(tx.hash).await.unwrap(), TxStatus::NotFound);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = MockChain::for_side(ChainSide::A);
        chain.fail_next_reads(1);
        assert!(chain.current_height().await.is_err());
        assert!(chain.current_height().await.is_ok());

        chain.fail_next_broadcast(SubmitError::Transient("timeout".to_string()));
        let tx = chain.prepare(&call(3)).await.unwrap();
        assert!(chain.broadcast(&tx).await.is_err());
        assert!(chain.broadcast(&tx).await.is_ok());
        assert_eq!(chain.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_relocate_event() {
        let chain = MockChain::for_side(ChainSide::A);
        let event = chain.emit_transfer(10, 1, Address::ZERO, U256::from(5u64));
        let moved = chain.relocate_event(&event, 11).unwrap();
        assert_eq!(moved.block_number, 11);
        assert_ne!(moved.block_hash, event.block_hash);
        assert_eq!(moved.transfer_id(), event.transfer_id());
        assert_eq!(chain.block_hash(11).await.unwrap(), Some(moved.block_hash));
        assert_ne!(chain.block_hash(10).await.unwrap(), Some(event.block_hash));
        assert_eq!(chain.block_hash(12).await.unwrap(), None);
    }
}
