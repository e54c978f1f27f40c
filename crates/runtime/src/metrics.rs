//! Worker counters.
//!
//! Every metric is labelled with the worker's mnemonic. Nothing here installs
//! a recorder; without one the calls are no-ops.

/// A request frame was written to a worker.
pub fn track_request(mnemonic: &str) {
    metrics::counter!("worker_requests_total", "mnemonic" => mnemonic.to_string()).increment(1);
}

/// A response frame was read back, `latency_sec` after its request was sent.
pub fn track_response(mnemonic: &str, exit_code: i32, latency_sec: f64) {
    metrics::counter!(
        "worker_responses_total",
        "mnemonic" => mnemonic.to_string(),
        "success" => (exit_code == 0).to_string()
    )
    .increment(1);

    metrics::histogram!(
        "worker_request_duration_seconds",
        "mnemonic" => mnemonic.to_string()
    )
    .record(latency_sec);
}

/// A worker operation failed; `kind` is [`Error::kind`](persistent_worker_core::Error::kind).
pub fn track_failure(mnemonic: &str, kind: &'static str) {
    metrics::counter!(
        "worker_failures_total",
        "mnemonic" => mnemonic.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn track_destroyed(mnemonic: &str) {
    metrics::counter!("worker_destroyed_total", "mnemonic" => mnemonic.to_string()).increment(1);
}
