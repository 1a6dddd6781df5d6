//! Metrics definitions for the classroom service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cs_` prefix for the classroom service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded; room, participant and connection ids never appear as
//! label values:
//! - `message_type`: bounded by the signaling event set (~20 values)
//! - `error_type`: bounded by `CsError::error_type_label` (10 values)
//! - `operation`: bounded by code (store commands, media and backend calls)
//! - `reason`: bounded drop reasons (2-3 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling handler latency (p99 < 100ms excluding backend calls)
        .set_buckets_for_metric(
            Matcher::Prefix("cs_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Redis presence latency (p99 < 10ms)
        .set_buckets_for_metric(
            Matcher::Prefix("cs_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        // Media engine and backend calls are bounded by CS_CALL_TIMEOUT_MS
        .set_buckets_for_metric(
            Matcher::Suffix("call_latency_seconds".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set call latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Room Metrics (Gauges)
// ============================================================================

/// Set the number of open signaling connections on this node.
///
/// Metric: `cs_connections_active`
/// Labels: none
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_connections_active").set(count as f64);
}

/// Set the number of rooms holding a media router on this node.
///
/// Metric: `cs_rooms_active`
/// Labels: none
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_rooms_active").set(count as f64);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record signaling message processing latency.
///
/// Metric: `cs_message_latency_seconds`
/// Labels: `message_type`
///
/// Cardinality: ~20 (bounded by the inbound event set)
pub fn record_message_latency(message_type: &'static str, duration: Duration) {
    histogram!("cs_message_latency_seconds", "message_type" => message_type)
        .record(duration.as_secs_f64());
}

/// Record presence store operation latency.
///
/// Metric: `cs_store_latency_seconds`
/// Labels: `operation`
///
/// Operations: sadd, srem, smembers, hset, hgetall, hget, del, attach, detach
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("cs_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record media engine call latency.
///
/// Metric: `cs_media_call_latency_seconds`
/// Labels: `operation`
pub fn record_media_call_latency(operation: &'static str, duration: Duration) {
    histogram!("cs_media_call_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record backend collaborator call latency.
///
/// Metric: `cs_backend_call_latency_seconds`
/// Labels: `operation`
///
/// Operations: find_user, find_class, record_attendance, create_chat_message
pub fn record_backend_call_latency(operation: &'static str, duration: Duration) {
    histogram!("cs_backend_call_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

// ============================================================================
// Error Metrics (Counters)
// ============================================================================

/// Record a handler failure reported to a client as an `error` event.
///
/// Metric: `cs_handler_errors_total`
/// Labels: `message_type`, `error_type`
pub fn record_handler_error(message_type: &'static str, error_type: &'static str) {
    counter!(
        "cs_handler_errors_total",
        "message_type" => message_type,
        "error_type" => error_type
    )
    .increment(1);
}

/// Record a panicking handler invocation.
///
/// Metric: `cs_handler_panics_total`
/// Labels: none
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_handler_panic() {
    counter!("cs_handler_panics_total").increment(1);
}

/// Record an event that could not be fanned out to other nodes.
///
/// Metric: `cs_bus_events_dropped_total`
/// Labels: `reason` (queue_full, serialize, publish_failed)
pub fn record_bus_event_dropped(reason: &'static str) {
    counter!("cs_bus_events_dropped_total", "reason" => reason).increment(1);
}

/// Record rooms torn down by the idle sweeper.
///
/// Metric: `cs_rooms_evicted_total`
/// Labels: none
pub fn record_rooms_evicted(count: usize) {
    counter!("cs_rooms_evicted_total").increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_handler_error_counter_uses_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_handler_error("consume", "incompatible_capabilities");
            record_handler_error("consume", "incompatible_capabilities");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let found = snapshot.iter().any(|(key, _, _, value)| {
            let labels: Vec<_> = key.key().labels().map(|l| l.value().to_string()).collect();
            key.key().name() == "cs_handler_errors_total"
                && labels.contains(&"consume".to_string())
                && matches!(value, DebugValue::Counter(2))
        });
        assert!(found, "expected counter with value 2, got {snapshot:?}");
    }

    #[test]
    fn test_gauges_and_histograms_record() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(3);
            set_rooms_active(2);
            record_message_latency("join-room", Duration::from_millis(12));
            record_store_latency("attach", Duration::from_millis(1));
            record_rooms_evicted(4);
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        for expected in [
            "cs_connections_active",
            "cs_rooms_active",
            "cs_message_latency_seconds",
            "cs_store_latency_seconds",
            "cs_rooms_evicted_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
