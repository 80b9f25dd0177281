//! EVM chain connector
//!
//! Reads go through an ordered list of HTTP providers (primary first, then
//! fallbacks). Destination transactions are signed locally so their hash can
//! be persisted before the raw bytes are sent.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{
    BlockNumberOrTag, BlockTransactionsKind, Filter, Log, TransactionRequest,
};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::future::Future;
use tracing::{debug, info, warn};

use super::{ChainConnector, DestinationCall, PendingSubmission, PreparedTx, TxStatus};
use crate::config::ChainConfig;
use crate::contracts::TokenBridge;
use crate::error::SubmitError;
use crate::retry::RetryConfig;
use crate::types::{ChainSide, CompensationKind, RawEvent, TransferId};

type HttpProvider = RootProvider<Http<Client>>;

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> Result<Vec<HttpProvider>> {
    if urls.is_empty() {
        return Err(eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}

pub struct EvmConnector {
    side: ChainSide,
    name: String,
    chain_id: u64,
    bridge_address: Address,
    /// Counterpart chain name, used to sanity check `targetChain`
    counterpart_name: String,
    providers: Vec<HttpProvider>,
    wallet: EthereumWallet,
    signer_address: Address,
    retry: RetryConfig,
}

impl EvmConnector {
    pub fn new(
        config: &ChainConfig,
        counterpart_name: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let providers = create_providers(&config.all_rpc_urls())?;
        let bridge_address = config.bridge_address()?;

        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .map_err(|e| eyre!("Invalid private key for chain {}: {}", config.name, e))?;
        let signer_address = signer.address();

        info!(
            chain = %config.side,
            name = %config.name,
            chain_id = config.chain_id,
            bridge = %bridge_address,
            relayer = %signer_address,
            rpc_endpoints = providers.len(),
            "EVM connector initialized"
        );

        Ok(Self {
            side: config.side,
            name: config.name.clone(),
            chain_id: config.chain_id,
            bridge_address,
            counterpart_name: counterpart_name.into(),
            providers,
            wallet: EthereumWallet::from(signer),
            signer_address,
            retry,
        })
    }

    pub fn signer_address(&self) -> Address {
        self.signer_address
    }

    /// Run `op` against each provider in order until one succeeds
    async fn with_fallback<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn(HttpProvider) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match op(provider.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        chain = %self.side,
                        endpoint = index,
                        error = %e,
                        "RPC call {} failed, trying next endpoint", what
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| eyre!("no RPC endpoints configured"))
            .wrap_err(format!("{} failed on all endpoints of {}", what, self.name)))
    }

    /// Decode a `eth_getLogs` batch, ordered by position.
    ///
    /// A log that matches the event signature but does not decode fails the
    /// whole batch so the range is fetched again rather than skipped.
    fn decode_logs(&self, logs: &[Log]) -> Result<Vec<RawEvent>> {
        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|log| !log.removed) {
            let event = self.parse_bridge_log(log).wrap_err_with(|| {
                format!(
                    "Undecodable BridgeInitiated log on {} (tx {:?}, log index {:?})",
                    self.name, log.transaction_hash, log.log_index
                )
            })?;
            events.push(event);
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    fn parse_bridge_log(&self, log: &Log) -> Result<RawEvent> {
        let decoded = log
            .log_decode::<TokenBridge::BridgeInitiated>()
            .map_err(|e| eyre!("Failed to decode BridgeInitiated: {}", e))?;
        let event = &decoded.inner.data;

        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| eyre!("Missing transaction hash"))?;
        let block_hash = log.block_hash.ok_or_else(|| eyre!("Missing block hash"))?;
        let block_number = log
            .block_number
            .ok_or_else(|| eyre!("Missing block number"))?;
        let log_index = log.log_index.ok_or_else(|| eyre!("Missing log index"))?;

        if !event
            .targetChain
            .eq_ignore_ascii_case(&self.counterpart_name)
        {
            warn!(
                chain = %self.side,
                tx_hash = %tx_hash,
                log_index,
                target_chain = %event.targetChain,
                expected = %self.counterpart_name,
                "BridgeInitiated targetChain does not name the counterpart chain, routing to counterpart anyway"
            );
        }

        Ok(RawEvent {
            source: self.side,
            source_chain_id: self.chain_id,
            tx_hash,
            log_index,
            block_number,
            block_hash,
            user: event.user,
            amount: event.amount,
            target_chain: event.targetChain.clone(),
            advisory_tx_hash: event.txHash,
        })
    }

    fn calldata(call: &DestinationCall) -> Vec<u8> {
        let key = call.idempotency_key.to_b256();
        match call.kind {
            CompensationKind::Mint => TokenBridge::mintTokensCall {
                user: call.user,
                amount: call.amount,
                idempotencyKey: key,
            }
            .abi_encode(),
            CompensationKind::Release => TokenBridge::releaseTokensCall {
                user: call.user,
                amount: call.amount,
                idempotencyKey: key,
            }
            .abi_encode(),
        }
    }
}

fn submit_error(context: &str, e: impl std::fmt::Display) -> SubmitError {
    SubmitError::from_message(format!("{}: {}", context, e))
}

#[async_trait]
impl ChainConnector for EvmConnector {
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
        self.with_fallback("eth_blockNumber", |p| async move {
            Ok(p.get_block_number().await?)
        })
        .await
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        self.with_fallback("eth_getBlockByNumber", |p| async move {
            let block = p
                .get_block_by_number(
                    BlockNumberOrTag::Number(height),
                    BlockTransactionsKind::Hashes,
                )
                .await?;
            Ok(block.map(|b| b.header.hash))
        })
        .await
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(TokenBridge::BridgeInitiated::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let logs = self
            .with_fallback("eth_getLogs", |p| {
                let filter = filter.clone();
                async move { Ok(p.get_logs(&filter).await?) }
            })
            .await?;

        let events = self.decode_logs(&logs)?;

        debug!(
            chain = %self.side,
            from_block = from,
            to_block = to,
            events = events.len(),
            "Fetched bridge events"
        );
        Ok(events)
    }

    async fn prepare(&self, call: &DestinationCall) -> Result<PreparedTx, SubmitError> {
        let provider = &self.providers[0];

        let nonce = provider
            .get_transaction_count(self.signer_address)
            .pending()
            .await
            .map_err(|e| submit_error("Failed to get nonce", e))?;
        let base_gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| submit_error("Failed to get gas price", e))?;
        let gas_price = self.retry.gas_price_for_attempt(base_gas_price, call.attempt);

        let tx = TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(self.bridge_address)
            .with_input(Self::calldata(call))
            .with_nonce(nonce)
            .with_chain_id(self.chain_id)
            .with_gas_price(gas_price);

        let gas = provider
            .estimate_gas(&tx)
            .await
            .map_err(|e| submit_error("Failed to estimate gas", e))?;
        let tx = tx.with_gas_limit(gas.saturating_mul(12) / 10);

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| SubmitError::Permanent(format!("Failed to sign transaction: {}", e)))?;
        let hash = *envelope.tx_hash();

        debug!(
            chain = %self.side,
            transfer_id = %call.idempotency_key,
            method = %call.kind,
            nonce,
            gas_price,
            attempt = call.attempt,
            tx_hash = %hash,
            "Prepared destination transaction"
        );

        Ok(PreparedTx {
            hash,
            raw: envelope.encoded_2718().into(),
        })
    }

    async fn broadcast(&self, tx: &PreparedTx) -> Result<PendingSubmission, SubmitError> {
        let mut last_error = None;
        for provider in &self.providers {
            match provider.send_raw_transaction(&tx.raw).await {
                Ok(pending) => {
                    return Ok(PendingSubmission {
                        chain: self.side,
                        hash: *pending.tx_hash(),
                    })
                }
                Err(e) if e.to_string().to_lowercase().contains("already known") => {
                    return Ok(PendingSubmission {
                        chain: self.side,
                        hash: tx.hash,
                    })
                }
                Err(e) => {
                    let err = submit_error("Failed to broadcast transaction", e);
                    if err.is_permanent() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| SubmitError::Transient("no RPC endpoints configured".to_string())))
    }

    async fn tx_status(&self, hash: B256) -> Result<TxStatus> {
        self.with_fallback("transaction status", |p| async move {
            if let Some(receipt) = p.get_transaction_receipt(hash).await? {
                let block = receipt
                    .block_number
                    .ok_or_else(|| eyre!("receipt without block number"))?;
                return Ok(TxStatus::Included {
                    block,
                    success: receipt.status(),
                });
            }
            Ok(match p.get_transaction_by_hash(hash).await? {
                Some(_) => TxStatus::Pending,
                None => TxStatus::NotFound,
            })
        })
        .await
    }

    async fn is_processed(&self, key: &TransferId) -> Result<bool> {
        let bridge_address = self.bridge_address;
        let key = key.to_b256();
        self.with_fallback("processedTransfers", |p| async move {
            let bridge = TokenBridge::new(bridge_address, p);
            let result = bridge.processedTransfers(key).call().await?;
            Ok(result._0)
        })
        .await
    }
}
