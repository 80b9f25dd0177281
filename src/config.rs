use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::{CircuitBreakerConfig, RetryConfig};
use crate::types::ChainSide;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain_a: ChainConfig,
    pub chain_b: ChainConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?;
        if url.is_empty() {
            return Err(eyre!("DATABASE_URL cannot be empty"));
        }
        Ok(Self { url })
    }

    /// Database settings alone, for operator commands that never touch a chain
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_env()
    }
}

/// One bridged chain
#[derive(Clone)]
pub struct ChainConfig {
    pub side: ChainSide,
    pub name: String,
    pub rpc_url: String,
    /// Additional RPC URLs for fallback (tried in order when primary fails)
    pub rpc_fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
    /// Source events deeper than this are acted upon; destination
    /// transactions deeper than this are final
    pub required_confirmations: u64,
    /// First block to scan when no cursor has been persisted yet
    pub start_block: Option<u64>,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("side", &self.side)
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("required_confirmations", &self.required_confirmations)
            .field("start_block", &self.start_block)
            .finish()
    }
}

impl ChainConfig {
    /// All RPC URLs: primary followed by fallbacks.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }

    pub fn bridge_address(&self) -> Result<Address> {
        Address::from_str(&self.bridge_address)
            .wrap_err_with(|| format!("Invalid bridge address for chain {}", self.name))
    }
}

/// Engine tuning shared by ingestion, submission and reconciliation
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub max_block_range: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_lookback_blocks: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_pause_secs: u64,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..Default::default()
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            threshold: self.circuit_breaker_threshold,
            pause_duration: Duration::from_secs(self.circuit_breaker_pause_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval(),
            retry_initial_backoff_ms: default_initial_backoff(),
            retry_max_backoff_ms: default_max_backoff(),
            confirmation_timeout_secs: default_confirmation_timeout(),
            max_block_range: default_max_block_range(),
            reconcile_interval_secs: default_reconcile_interval(),
            reconcile_lookback_blocks: default_reconcile_lookback(),
            circuit_breaker_threshold: 10,
            circuit_breaker_pause_secs: 300,
        }
    }
}

/// Status API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Default functions
fn default_required_confirmations() -> u64 {
    12
}

fn default_max_attempts() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_confirmation_timeout() -> u64 {
    120
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_reconcile_lookback() -> u64 {
    64
}

fn default_api_port() -> u16 {
    9092
}

/// Parse a comma-separated RPC URL list, dropping blanks
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// `Ok(None)` when `key` is unset; a set but malformed value is an error
fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} has invalid value {:?}: {}", key, raw, e)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(eyre!("{} could not be read: {}", key, e)),
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig::from_env()?;

        let chain_a = chain_from_env(ChainSide::A)?;
        let chain_b = chain_from_env(ChainSide::B)?;

        let engine = EngineConfig {
            max_attempts: parse_env("MAX_ATTEMPTS")?.unwrap_or(default_max_attempts()),
            poll_interval_ms: parse_env("POLL_INTERVAL_MS")?.unwrap_or(default_poll_interval()),
            retry_initial_backoff_ms: parse_env("RETRY_INITIAL_BACKOFF_MS")?
                .unwrap_or(default_initial_backoff()),
            retry_max_backoff_ms: parse_env("RETRY_MAX_BACKOFF_MS")?
                .unwrap_or(default_max_backoff()),
            confirmation_timeout_secs: parse_env("CONFIRMATION_TIMEOUT_SECS")?
                .unwrap_or(default_confirmation_timeout()),
            max_block_range: parse_env("MAX_BLOCK_RANGE")?.unwrap_or(default_max_block_range()),
            reconcile_interval_secs: parse_env("RECONCILE_INTERVAL_SECS")?
                .unwrap_or(default_reconcile_interval()),
            reconcile_lookback_blocks: parse_env("RECONCILE_LOOKBACK_BLOCKS")?
                .unwrap_or(default_reconcile_lookback()),
            circuit_breaker_threshold: parse_env("CIRCUIT_BREAKER_THRESHOLD")?.unwrap_or(10),
            circuit_breaker_pause_secs: parse_env("CIRCUIT_BREAKER_PAUSE_SECS")?.unwrap_or(300),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("API_PORT")?.unwrap_or(default_api_port()),
        };

        let logging = LoggingConfig {
            format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let config = Config {
            database,
            chain_a,
            chain_b,
            engine,
            api,
            logging,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, side: ChainSide) -> &ChainConfig {
        match side {
            ChainSide::A => &self.chain_a,
            ChainSide::B => &self.chain_b,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for chain in [&self.chain_a, &self.chain_b] {
            let prefix = env_prefix(chain.side);

            if chain.rpc_url.is_empty() {
                return Err(eyre!("{}_RPC_URL cannot be empty", prefix));
            }

            if chain.bridge_address.len() != 42 || !chain.bridge_address.starts_with("0x") {
                return Err(eyre!(
                    "{}_BRIDGE_ADDRESS must be a valid hex address (42 chars with 0x prefix)",
                    prefix
                ));
            }
            chain.bridge_address()?;

            if chain.private_key.len() != 66 || !chain.private_key.starts_with("0x") {
                return Err(eyre!(
                    "{}_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)",
                    prefix
                ));
            }
            if hex::decode(&chain.private_key[2..]).is_err() {
                return Err(eyre!("{}_PRIVATE_KEY must be hex encoded", prefix));
            }

            if self.engine.reconcile_lookback_blocks <= chain.required_confirmations {
                return Err(eyre!(
                    "RECONCILE_LOOKBACK_BLOCKS ({}) must exceed {}_REQUIRED_CONFIRMATIONS ({})",
                    self.engine.reconcile_lookback_blocks,
                    prefix,
                    chain.required_confirmations
                ));
            }
        }

        // Both sides sharing a chain id would derive colliding transfer ids
        // and make every event look like a transfer to itself.
        if self.chain_a.chain_id == self.chain_b.chain_id {
            return Err(eyre!(
                "CHAIN_A_CHAIN_ID and CHAIN_B_CHAIN_ID must differ (both are {})",
                self.chain_a.chain_id
            ));
        }

        if self.engine.max_attempts == 0 {
            return Err(eyre!("MAX_ATTEMPTS must be at least 1"));
        }

        if self.engine.max_block_range == 0 {
            return Err(eyre!("MAX_BLOCK_RANGE must be at least 1"));
        }

        Ok(())
    }
}

fn env_prefix(side: ChainSide) -> &'static str {
    match side {
        ChainSide::A => "CHAIN_A",
        ChainSide::B => "CHAIN_B",
    }
}

fn chain_from_env(side: ChainSide) -> Result<ChainConfig> {
    let prefix = env_prefix(side);
    let var = |suffix: &str| format!("{}_{}", prefix, suffix);

    let rpc_raw = env::var(var("RPC_URL"))
        .map_err(|_| eyre!("{} environment variable is required", var("RPC_URL")))?;
    let rpc_urls = parse_rpc_urls(&rpc_raw);
    if rpc_urls.is_empty() {
        return Err(eyre!("{} cannot be empty", var("RPC_URL")));
    }

    let private_key = env::var(var("PRIVATE_KEY"))
        .or_else(|_| env::var("RELAYER_PRIVATE_KEY"))
        .map_err(|_| {
            eyre!(
                "{} or RELAYER_PRIVATE_KEY environment variable is required",
                var("PRIVATE_KEY")
            )
        })?;

    Ok(ChainConfig {
        side,
        name: env::var(var("NAME")).unwrap_or_else(|_| format!("chain-{}", side)),
        rpc_url: rpc_urls[0].clone(),
        rpc_fallback_urls: rpc_urls[1..].to_vec(),
        chain_id: env::var(var("CHAIN_ID"))
            .map_err(|_| eyre!("{} environment variable is required", var("CHAIN_ID")))?
            .parse()
            .wrap_err_with(|| format!("{} must be a valid u64", var("CHAIN_ID")))?,
        bridge_address: env::var(var("BRIDGE_ADDRESS"))
            .map_err(|_| eyre!("{} environment variable is required", var("BRIDGE_ADDRESS")))?,
        private_key,
        required_confirmations: parse_env(&var("REQUIRED_CONFIRMATIONS"))?
            .unwrap_or(default_required_confirmations()),
        start_block: parse_env(&var("START_BLOCK"))?,
    })
}
