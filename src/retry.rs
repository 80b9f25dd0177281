//! Retry and error recovery utilities for destination submissions
//!
//! Provides exponential backoff, replacement gas bumping, error classification
//! and the consecutive-failure circuit breaker used by the long-running loops.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Submission retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Submission attempts per transfer before it is marked failed
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Gas price bump percentage per replacement
    pub gas_bump_percent: u32,
    /// Maximum gas price multiplier (e.g., 3 = 3x original)
    pub max_gas_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            gas_bump_percent: 20,
            max_gas_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(
            (self.initial_backoff.as_secs_f64() * factor).min(self.max_backoff.as_secs_f64()),
        )
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Gas price for a submission attempt (1-indexed; the first attempt pays the base price)
    pub fn gas_price_for_attempt(&self, base_gas_price: u128, attempt: u32) -> u128 {
        if attempt <= 1 {
            return base_gas_price;
        }

        let replacements = (attempt - 1) as f64;
        let multiplier = (1.0 + replacements * self.gas_bump_percent as f64 / 100.0)
            .min(self.max_gas_multiplier);
        (base_gas_price as f64 * multiplier) as u128
    }

    /// Earliest time the next attempt may run, after `attempts` have been made
    pub fn next_retry_after(&self, attempts: u32) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempts.saturating_sub(1));
        let backoff = chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() + backoff
    }
}

/// Retry class of a failed submission
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced, retry with higher gas
    Underpriced,
    /// Nonce already used or not yet usable
    NonceConflict,
    /// Permanent failure, do not retry (invalid params, contract error)
    Permanent,
    /// Unknown error, retried with backoff
    Unknown,
}

impl ErrorClass {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorClass::Permanent)
    }
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "rate limit",
    "too many requests",
    "502",
    "503",
    "temporarily unavailable",
    "header not found",
];

const UNDERPRICED_PATTERNS: &[&str] = &[
    "underpriced",
    "replacement transaction",
    "gas price too low",
    "max fee per gas less than",
    "fee cap less than block base fee",
];

const NONCE_PATTERNS: &[&str] = &["nonce too low", "nonce too high", "already known"];

/// Destination contract or signer rejections that a resubmission cannot fix
const PERMANENT_PATTERNS: &[&str] = &[
    "reverted",
    "missing role",
    "accesscontrol",
    "unauthorized",
    "invalid signature",
    "insufficient funds",
    "out of gas",
    "invalid parameters",
    "already processed",
];

/// Classify a provider or contract error message.
///
/// Checked in order transient, underpriced, nonce, permanent: a message that
/// mentions both a network symptom and a revert is retried.
pub fn classify_error(error: &str) -> ErrorClass {
    let error = error.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| error.contains(p));

    if matches(TRANSIENT_PATTERNS) {
        ErrorClass::Transient
    } else if matches(UNDERPRICED_PATTERNS) {
        ErrorClass::Underpriced
    } else if matches(NONCE_PATTERNS) {
        ErrorClass::NonceConflict
    } else if matches(PERMANENT_PATTERNS) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Unknown
    }
}

/// Circuit breaker configuration for long-running loops
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before pausing
    pub threshold: u32,
    /// How long to pause when the circuit breaker trips
    pub pause_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            pause_duration: Duration::from_secs(300),
        }
    }
}

/// Consecutive-failure counter for one loop
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failure and return the new consecutive count
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Pause duration if the breaker is tripped; resets the counter
    pub fn check(&mut self) -> Option<Duration> {
        if self.consecutive_failures >= self.config.threshold {
            self.consecutive_failures = 0;
            Some(self.config.pause_duration)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig::default();

        let backoffs: Vec<u64> = (0..7)
            .map(|attempt| config.backoff_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(backoffs, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(config.should_retry(1));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn test_replacement_gas_bump() {
        let config = RetryConfig::default();
        let gwei = 1_000_000_000u128;

        // first submission pays the node price, each replacement 20% more, at most 3x
        assert_eq!(config.gas_price_for_attempt(gwei, 1), gwei);
        assert_eq!(config.gas_price_for_attempt(gwei, 2), 1_200_000_000);
        assert_eq!(config.gas_price_for_attempt(gwei, 3), 1_400_000_000);
        assert_eq!(config.gas_price_for_attempt(gwei, 20), 3 * gwei);
    }

    #[test]
    fn test_next_retry_after_is_in_future() {
        let config = RetryConfig::default();
        let before = Utc::now();
        assert!(config.next_retry_after(1) > before);
    }

    #[test]
    fn test_destination_errors_are_classified() {
        assert_eq!(
            classify_error("error sending request: connection refused"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_error("nonce too low: next nonce 7"), ErrorClass::NonceConflict);
        assert_eq!(
            classify_error("execution reverted: AccessControl: account is missing role"),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_error("execution reverted: transfer already processed"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_error("unexpected response"), ErrorClass::Unknown);
        assert!(!classify_error("request timed out after execution reverted").is_permanent());
    }

    #[test]
    fn test_circuit_breaker_trips_and_resets() {
        let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
            threshold: 2,
            pause_duration: Duration::from_millis(5),
        });
        assert!(breaker.check().is_none());
        breaker.record_failure();
        assert!(breaker.check().is_none());
        assert_eq!(breaker.record_failure(), 2);
        assert_eq!(breaker.check(), Some(Duration::from_millis(5)));
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
