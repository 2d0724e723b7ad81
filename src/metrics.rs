use metrics::{counter, gauge, histogram};
use std::time::Instant;

// ── Metric names ────────────────────────────────────────────────────────

/// Total HTTP requests by endpoint and status
pub const REQUESTS_TOTAL: &str = "adedge_requests_total";
/// Request duration in seconds
pub const REQUEST_DURATION: &str = "adedge_request_duration_seconds";
/// Currently active ad breaks across all channels
pub const ACTIVE_BREAKS: &str = "adedge_active_breaks";
/// SCTE-35 signals observed, by result (accepted, rejected, stale, duplicate)
pub const SCTE35_SIGNALS: &str = "adedge_scte35_signals_total";
/// SCTE-35 payloads whose CRC-32 failed validation
pub const SCTE35_CRC_FAILURES: &str = "adedge_scte35_crc_failures_total";
/// Attribute-form vs binary-form duration disagreements
pub const SCTE35_DURATION_CONFLICTS: &str = "adedge_scte35_duration_conflicts_total";
/// Dedupe merges via the 60s start-proximity window
pub const DEDUPE_PROXIMITY_MERGES: &str = "adedge_dedupe_proximity_merges_total";
/// Decision RPCs by result (success, timeout, error, slate, empty)
pub const DECISION_REQUESTS: &str = "adedge_decision_requests_total";
/// Skip-count recomputations that disagreed with the bound value
pub const SKIP_COUNT_ANOMALIES: &str = "adedge_skip_count_anomalies_total";
/// Boundary-snap outcomes (exact, padded, trimmed, underrun, overrun, fallback)
pub const BOUNDARY_SNAP: &str = "adedge_boundary_snap_total";
/// Manifest requests answered from the KV fast path
pub const KV_FAST_PATH_HITS: &str = "adedge_kv_fast_path_hits_total";
/// Manifest requests answered from the micro-cache
pub const MICRO_CACHE_HITS: &str = "adedge_micro_cache_hits_total";
/// Requests that bypassed an overloaded channel serializer
pub const SERIALIZER_BYPASS: &str = "adedge_serializer_bypass_total";
/// Origin fetch errors
pub const ORIGIN_FETCH_ERRORS: &str = "adedge_origin_fetch_errors_total";
/// Beacon publishes by result (success, error)
pub const BEACONS: &str = "adedge_beacons_total";
/// Monitor poll cycles by result (signal, idle, error)
pub const MONITOR_POLLS: &str = "adedge_monitor_polls_total";

// ── Recording helpers ───────────────────────────────────────────────────

pub fn record_request(endpoint: &str, status: u16) {
    counter!(REQUESTS_TOTAL, "endpoint" => endpoint.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_duration(endpoint: &str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!(REQUEST_DURATION, "endpoint" => endpoint.to_string()).record(duration);
}

pub fn set_active_breaks(count: usize) {
    gauge!(ACTIVE_BREAKS).set(count as f64);
}

pub fn record_scte35_signal(result: &str) {
    counter!(SCTE35_SIGNALS, "result" => result.to_string()).increment(1);
}

pub fn record_crc_failure() {
    counter!(SCTE35_CRC_FAILURES).increment(1);
}

pub fn record_duration_conflict() {
    counter!(SCTE35_DURATION_CONFLICTS).increment(1);
}

pub fn record_proximity_merge() {
    counter!(DEDUPE_PROXIMITY_MERGES).increment(1);
}

pub fn record_decision(result: &str) {
    counter!(DECISION_REQUESTS, "result" => result.to_string()).increment(1);
}

pub fn record_skip_count_anomaly() {
    counter!(SKIP_COUNT_ANOMALIES).increment(1);
}

pub fn record_boundary_snap(outcome: &str) {
    counter!(BOUNDARY_SNAP, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_kv_fast_path_hit() {
    counter!(KV_FAST_PATH_HITS).increment(1);
}

pub fn record_micro_cache_hit() {
    counter!(MICRO_CACHE_HITS).increment(1);
}

pub fn record_serializer_bypass() {
    counter!(SERIALIZER_BYPASS).increment(1);
}

pub fn record_origin_error() {
    counter!(ORIGIN_FETCH_ERRORS).increment(1);
}

pub fn record_beacon(result: &str) {
    counter!(BEACONS, "result" => result.to_string()).increment(1);
}

pub fn record_monitor_poll(result: &str) {
    counter!(MONITOR_POLLS, "result" => result.to_string()).increment(1);
}
