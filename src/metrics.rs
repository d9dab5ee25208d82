//! Prometheus metrics for chain runtimes
//!
//! Collectors are registered in the default registry; exposing them is left
//! to the host process.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

lazy_static! {
    // Block processing metrics
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "chain_relayer_blocks_processed_total",
        "Total number of blocks scanned by the listener",
        &["chain"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "chain_relayer_latest_block",
        "Latest chain head observed by the listener",
        &["chain"]
    ).unwrap();

    pub static ref CHECKPOINT: GaugeVec = register_gauge_vec!(
        "chain_relayer_checkpoint",
        "Next block height the listener will scan",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_ROUTED: CounterVec = register_counter_vec!(
        "chain_relayer_events_routed_total",
        "Messages handed to the router",
        &["chain", "kind"]
    ).unwrap();

    pub static ref EVENTS_SKIPPED: CounterVec = register_counter_vec!(
        "chain_relayer_events_skipped_total",
        "Logs that could not be decoded and were skipped",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TXS_SUBMITTED: CounterVec = register_counter_vec!(
        "chain_relayer_transactions_submitted_total",
        "Vote and execute transactions by outcome",
        &["chain", "action", "status"]
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "chain_relayer_submission_latency_seconds",
        "Time from message receipt to accepted submission",
        &["chain", "action"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "chain_relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();
}

/// Record a scanned block range and the head it was scanned against
pub fn record_blocks_processed(chain: &str, count: u64, latest: u64, checkpoint: u64) {
    BLOCKS_PROCESSED.with_label_values(&[chain]).inc_by(count as f64);
    LATEST_BLOCK.with_label_values(&[chain]).set(latest as f64);
    CHECKPOINT.with_label_values(&[chain]).set(checkpoint as f64);
}

pub fn record_event_routed(chain: &str, kind: &str) {
    EVENTS_ROUTED.with_label_values(&[chain, kind]).inc();
}

pub fn record_event_skipped(chain: &str) {
    EVENTS_SKIPPED.with_label_values(&[chain]).inc();
}

/// Record a transaction outcome: "submitted", "skipped", "dropped" or "failed"
pub fn record_transaction(chain: &str, action: &str, status: &str) {
    TXS_SUBMITTED
        .with_label_values(&[chain, action, status])
        .inc();
}

pub fn record_submission_latency(chain: &str, action: &str, seconds: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[chain, action])
        .observe(seconds);
}

pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_blocks_processed() {
        record_blocks_processed("metrics-test", 6, 100, 96);
        assert_eq!(
            LATEST_BLOCK.with_label_values(&["metrics-test"]).get(),
            100.0
        );
        assert_eq!(CHECKPOINT.with_label_values(&["metrics-test"]).get(), 96.0);
        assert!(BLOCKS_PROCESSED.with_label_values(&["metrics-test"]).get() >= 6.0);
    }
}
