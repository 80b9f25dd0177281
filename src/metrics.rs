//! Prometheus metrics for the bridge relayer
//!
//! Exposed on the /metrics endpoint of the status API.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::types::TransferState;

lazy_static! {
    // Ingestion
    pub static ref LAST_PROCESSED_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_relayer_last_processed_block",
        "Highest source block whose events are durably ingested",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_height",
        "Latest chain head seen by the relayer",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "bridge_relayer_events_observed_total",
        "BridgeInitiated events recorded as new transfers",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_DUPLICATE: CounterVec = register_counter_vec!(
        "bridge_relayer_events_duplicate_total",
        "BridgeInitiated events already present in the ledger",
        &["chain"]
    ).unwrap();

    // Lifecycle
    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_state_transitions_total",
        "Transfer state transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref TRANSFERS_BY_STATE: GaugeVec = register_gauge_vec!(
        "bridge_relayer_transfers",
        "Transfers currently in each state",
        &["state"]
    ).unwrap();

    pub static ref PERMANENT_FAILURES: CounterVec = register_counter_vec!(
        "bridge_relayer_permanent_failures_total",
        "Transfers moved to failed",
        &["chain"]
    ).unwrap();

    // Submission
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_submissions_total",
        "Destination transactions broadcast",
        &["chain", "status"]
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "bridge_relayer_submission_latency_seconds",
        "Time from claim to destination inclusion",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "bridge_relayer_consecutive_failures",
        "Consecutive loop failures (circuit breaker)",
        &["component", "chain"]
    ).unwrap();

    // Reconciliation
    pub static ref RECONCILIATION_ACTIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_reconciliation_actions_total",
        "Corrections made by the reconciliation scanner",
        &["chain", "action"]
    ).unwrap();

    pub static ref REORG_INCONSISTENCIES: CounterVec = register_counter_vec!(
        "bridge_relayer_reorg_inconsistencies_total",
        "Transfers acted upon whose source event left the canonical chain",
        &["chain"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "bridge_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn record_cursor(chain: &str, block: u64) {
    LAST_PROCESSED_BLOCK
        .with_label_values(&[chain])
        .set(block as f64);
}

pub fn record_height(chain: &str, height: u64) {
    CHAIN_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

/// Record a broadcast attempt
pub fn record_submission(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SUBMISSIONS.with_label_values(&[chain, status]).inc();
}

pub fn record_submission_latency(chain: &str, seconds: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[chain])
        .observe(seconds);
}

/// Update consecutive failures (circuit breaker)
pub fn set_consecutive_failures(component: &str, chain: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[component, chain])
        .set(count as f64);
}

pub fn record_reconciliation(chain: &str, action: &str, count: usize) {
    if count > 0 {
        RECONCILIATION_ACTIONS
            .with_label_values(&[chain, action])
            .inc_by(count as f64);
    }
}

/// Publish per-state counts; states without transfers are reported as zero
pub fn set_state_counts<'a>(counts: impl IntoIterator<Item = (&'a TransferState, &'a i64)>) {
    for state in TransferState::ALL {
        TRANSFERS_BY_STATE.with_label_values(&[state.as_str()]).set(0.0);
    }
    for (state, count) in counts {
        TRANSFERS_BY_STATE
            .with_label_values(&[state.as_str()])
            .set(*count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_state_counts_reset_missing_states() {
        let mut counts = BTreeMap::new();
        counts.insert(TransferState::Failed, 3i64);
        set_state_counts(&counts);
        assert_eq!(
            TRANSFERS_BY_STATE.with_label_values(&["failed"]).get(),
            3.0
        );
        assert_eq!(
            TRANSFERS_BY_STATE.with_label_values(&["observed"]).get(),
            0.0
        );
    }

    #[test]
    fn test_reconciliation_skips_zero() {
        let before = RECONCILIATION_ACTIONS
            .with_label_values(&["a", "noop-test"])
            .get();
        record_reconciliation("a", "noop-test", 0);
        record_reconciliation("a", "noop-test", 2);
        assert_eq!(
            RECONCILIATION_ACTIONS
                .with_label_values(&["a", "noop-test"])
                .get(),
            before + 2.0
        );
    }
}
