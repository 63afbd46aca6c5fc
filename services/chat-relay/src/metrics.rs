//! Prometheus metrics exposition and in-process counters
//!
//! - `relay_requests_total` (counter): label `status`
//! - `relay_request_duration_seconds` (histogram): label `status`, time to response head
//! - `relay_upstream_errors_total` (counter): label `error_type`
//! - `relay_key_penalties_total` (counter)
//! - `relay_stream_chunks_total` (counter)
//! - `relay_stream_malformed_total` (counter)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// `relay_request_duration_seconds` renders as a histogram (`_bucket` lines)
/// rather than the default summary, covering 5ms to 60s.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("relay_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Build a recorder that is not installed globally. Only one global recorder
/// may exist per process, so tests use this with a local default.
pub fn build_recorder() -> Result<PrometheusRecorder, BuildError> {
    Ok(builder()?.build_recorder())
}

/// Record a finished chat request (success means the stream head was sent).
pub fn record_request(status: u16, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("relay_requests_total", "status" => status.clone()).increment(1);
    metrics::histogram!("relay_request_duration_seconds", "status" => status)
        .record(duration_secs);
}

/// Record an upstream-side failure with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("relay_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a key being taken out of rotation after a 429.
pub fn record_key_penalty() {
    metrics::counter!("relay_key_penalties_total").increment(1);
}

/// Record content increments forwarded to a client.
pub fn record_stream_chunks(count: u64) {
    metrics::counter!("relay_stream_chunks_total").increment(count);
}

/// Record an upstream fragment that could not be parsed and was skipped.
pub fn record_stream_malformed() {
    metrics::counter!("relay_stream_malformed_total").increment(1);
}

/// Runtime counters surfaced by `/health`.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Streams currently being relayed. Read on shutdown to report undrained requests.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one `in_flight` slot for as long as a relayed body is alive.
///
/// The guard moves into the response stream, so the slot is released when
/// the stream finishes or the client disconnects and the body is dropped.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    pub fn acquire(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, 0.05);
        record_upstream_error("transport");
        record_key_penalty();
        record_stream_chunks(3);
        record_stream_malformed();
    }

    #[test]
    fn record_request_renders_counter_and_histogram_buckets() {
        let recorder = build_recorder().unwrap();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, 0.042);
        record_request(503, 0.003);

        let output = handle.render();
        assert!(output.contains("relay_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("relay_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn upstream_and_key_counters_render() {
        let recorder = build_recorder().unwrap();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("exhausted");
        record_upstream_error("transport");
        record_key_penalty();
        record_stream_chunks(5);
        record_stream_malformed();

        let output = handle.render();
        assert!(output.contains("error_type=\"exhausted\""));
        assert!(output.contains("error_type=\"transport\""));
        assert!(output.contains("relay_key_penalties_total 1"));
        assert!(output.contains("relay_stream_chunks_total 5"));
        assert!(output.contains("relay_stream_malformed_total 1"));
    }

    #[test]
    fn in_flight_guard_releases_on_drop() {
        let metrics = ServiceMetrics::new();
        let first = InFlightGuard::acquire(&metrics.in_flight);
        let second = InFlightGuard::acquire(&metrics.in_flight);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 0);
    }
}
