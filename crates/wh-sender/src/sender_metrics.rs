//! Metrics for the delivery engine
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! process installs a recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one HTTP attempt and how long it took
pub fn record_attempt(result: &str, duration: Duration) {
    counter!(
        "wh_delivery_attempts_total",
        "result" => result.to_string()
    )
    .increment(1);

    histogram!("wh_delivery_duration_seconds").record(duration.as_secs_f64());
}

/// Record a work item reaching a terminal outcome
pub fn record_delivery(outcome: &str) {
    counter!(
        "wh_deliveries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_circuit_rejection() {
    counter!("wh_circuit_rejections_total").increment(1);
}

pub fn record_retry_scheduled() {
    counter!("wh_retries_scheduled_total").increment(1);
}

pub fn set_policies_tracked(count: usize) {
    gauge!("wh_policies_tracked").set(count as f64);
}

pub fn record_sweep(removed: usize, disabled: usize) {
    counter!("wh_sweeper_removed_total").increment(removed as u64);
    counter!("wh_sweeper_disabled_total").increment(disabled as u64);
}
