//! Prometheus metrics for the rotation scheduler
//!
//! This module provides metrics tracking for:
//! - Rotation: outcomes per campaign, publish attempts, tick duration, in-flight campaigns
//! - Finalizer: finalized campaigns, quota suspensions
//! - Trigger: HTTP requests by endpoint and status
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::sync::{Mutex, OnceLock, PoisonError};

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all scheduler metrics
struct SchedulerMetrics {
    rotations: CounterVec,
    publish_attempts: CounterVec,
    tick_duration: Histogram,
    running_campaigns: Gauge,
    finalized_campaigns: Counter,
    finalizer_suspensions: Counter,
    trigger_requests: CounterVec,
}

/// Global storage for scheduler metrics
static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

/// Set once registration has been attempted; held while registering
static INIT_ATTEMPTED: Mutex<bool> = Mutex::new(false);

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once and from several threads: only the first
/// call registers, later calls wait for it and return `Ok`. If
/// registration fails, recorders stay no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = thumbwheel::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let mut attempted = INIT_ATTEMPTED.lock().unwrap_or_else(PoisonError::into_inner);
    if *attempted {
        return Ok(());
    }
    *attempted = true;

    let metrics = SchedulerMetrics {
        rotations: register_counter_vec!(
            "thumbwheel_rotations_total",
            "Campaign rotations by outcome",
            &["outcome"]
        )?,
        publish_attempts: register_counter_vec!(
            "thumbwheel_publish_attempts_total",
            "Publish calls by result",
            &["result"]
        )?,
        tick_duration: register_histogram!(
            "thumbwheel_tick_duration_seconds",
            "Duration of one scheduler tick in seconds",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
        )?,
        running_campaigns: register_gauge!(
            "thumbwheel_running_campaigns",
            "Campaigns with an execution in flight"
        )?,
        finalized_campaigns: register_counter!(
            "thumbwheel_finalized_campaigns_total",
            "Campaigns moved to the finalized state"
        )?,
        finalizer_suspensions: register_counter!(
            "thumbwheel_finalizer_suspensions_total",
            "Finalizer runs stopped by an analytics quota signal"
        )?,
        trigger_requests: register_counter_vec!(
            "thumbwheel_trigger_requests_total",
            "Trigger API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
    };

    SCHEDULER_METRICS
        .set(metrics)
        .map_err(|_| "Scheduler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SCHEDULER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome of one campaign execution
pub fn record_rotation(outcome: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.rotations.with_label_values(&[outcome]).inc();
    }
}

/// Record one publish call
pub fn record_publish_attempt(result: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.publish_attempts.with_label_values(&[result]).inc();
    }
}

/// Record the wall-clock duration of a tick
pub fn observe_tick_duration(secs: f64) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.tick_duration.observe(secs);
    }
}

/// Update the number of in-flight campaign executions
pub fn set_running_campaigns(count: usize) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.running_campaigns.set(count as f64);
    }
}

/// Record a finalized campaign
pub fn record_finalized() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.finalized_campaigns.inc();
    }
}

/// Record a finalizer suspension
pub fn record_finalizer_suspension() {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.finalizer_suspensions.inc();
    }
}

/// Record a trigger API request
pub fn record_trigger_request(endpoint: &str, status: u16) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        let status_str = status.to_string();
        m.trigger_requests
            .with_label_values(&[endpoint, &status_str])
            .inc();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_rotation("succeeded");
        let text = encode_metrics().unwrap();
        assert!(text.contains("thumbwheel_rotations_total"));
    }

    #[test]
    fn test_recorders_do_not_panic() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
        record_publish_attempt("rate_limited");
        observe_tick_duration(0.25);
        set_running_campaigns(3);
        record_finalized();
        record_finalizer_suspension();
        record_trigger_request("/api/cron/rotate", 200);
    }
}
