//! Prometheus metrics exposition
//!
//! Service-level metrics recorded here:
//!
//! - `fetch_requests_total` (counter): label `outcome`
//! - `fetch_request_duration_seconds` (histogram): label `outcome`
//!
//! The scheduler records its own through the same global recorder:
//! `ladder_attempts_total{tier,result}`, `credential_cooldowns_total`,
//! `pending_queue_depth`, and `ledger_store_errors_total`.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for fetch duration. Queued requests can wait for
/// minutes, so the range runs well past the outbound timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("fetch_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `fetch_request_duration_seconds` gets explicit buckets so it renders as a
/// Prometheus histogram rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished fetch with its outcome (`direct`, `credential`,
/// `fallback`, `invalid`, or `error`).
pub fn record_fetch(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("fetch_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("fetch_request_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_fetch_does_not_panic_without_recorder() {
        record_fetch("direct", 0.05);
    }

    /// Isolated recorder/handle pair; install_recorder() panics on a second call.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_fetch_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_fetch("credential", 0.42);
        record_fetch("error", 3.0);

        let output = handle.render();
        assert!(output.contains("fetch_requests_total"));
        assert!(output.contains("outcome=\"credential\""));
        assert!(output.contains("outcome=\"error\""));
        assert!(
            output.contains("fetch_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"300\""));
    }

    #[test]
    fn scheduler_metrics_share_the_recorder() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::counter!("ledger_store_errors_total").increment(1);
        metrics::gauge!("pending_queue_depth").set(3.0);

        let output = handle.render();
        assert!(output.contains("ledger_store_errors_total 1"));
        assert!(output.contains("pending_queue_depth 3"));
    }
}
