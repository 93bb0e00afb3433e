//! Trigger layer metrics.
//!
//! Recorded through the `metrics` facade; they are no-ops until the host
//! process installs a recorder.
//!
//! ## Metrics
//!
//! ### Counters
//! - `trigger_layer_webhook_requests_total` - Webhook requests by outcome and reason
//! - `trigger_layer_cron_dispatches_total` - Cron plans by stage (planned, committed)
//! - `trigger_layer_cron_overlaps_total` - Runs refused by the overlap guard
//! - `trigger_layer_retries_total` - Retry decisions by outcome (scheduled, exhausted)
//! - `trigger_layer_manual_dispatches_total` - Manual dispatches by outcome
//!
//! ### Histograms
//! - `trigger_layer_retry_delay_seconds` - Computed retry delays
//!
//! ### Gauges
//! - `trigger_layer_active_cron_runs` - Runs held by the overlap guard

use metrics::{counter, gauge, histogram};

// =============================================================================
// Webhook Metrics
// =============================================================================

/// Record an accepted webhook request.
pub fn record_webhook_accepted(authenticated: bool) {
    counter!(
        "trigger_layer_webhook_requests_total",
        "outcome" => "accepted",
        "reason" => if authenticated { "authenticated" } else { "unauthenticated" }
    )
    .increment(1);
}

/// Record a rejected webhook request.
pub fn record_webhook_rejected(reason: &str) {
    counter!(
        "trigger_layer_webhook_requests_total",
        "outcome" => "rejected",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Cron Metrics
// =============================================================================

/// Record a cron plan moving through `stage`.
pub fn record_cron_dispatch(stage: &'static str) {
    counter!("trigger_layer_cron_dispatches_total", "stage" => stage).increment(1);
}

/// Record a run refused by the overlap guard.
pub fn record_cron_overlap() {
    counter!("trigger_layer_cron_overlaps_total").increment(1);
}

pub fn inc_active_cron_runs() {
    gauge!("trigger_layer_active_cron_runs").increment(1.0);
}

pub fn dec_active_cron_runs() {
    gauge!("trigger_layer_active_cron_runs").decrement(1.0);
}

// =============================================================================
// Retry Metrics
// =============================================================================

/// Record a scheduled retry and its delay.
pub fn record_retry_scheduled(delay_seconds: f64) {
    counter!("trigger_layer_retries_total", "outcome" => "scheduled").increment(1);
    histogram!("trigger_layer_retry_delay_seconds").record(delay_seconds);
}

/// Record a run whose retry budget ran out.
pub fn record_retry_exhausted() {
    counter!("trigger_layer_retries_total", "outcome" => "exhausted").increment(1);
}

// =============================================================================
// Manual Dispatch Metrics
// =============================================================================

pub fn record_manual_dispatch(outcome: &'static str, runs: usize) {
    counter!("trigger_layer_manual_dispatches_total", "outcome" => outcome)
        .increment(runs as u64);
}
