use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Build and install the global Prometheus recorder. When a recorder is
    /// already installed (tests construct multiple bridge states in one
    /// process) the existing one keeps receiving the macro traffic and this
    /// handle only renders its own empty registry.
    pub fn install() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_ok() {
            describe_metrics();
        }

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_metrics() {
    describe_counter!(
        "bridge_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "bridge_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from the client perspective"
    );
    describe_histogram!(
        "bridge_upstream_request_duration_seconds",
        Unit::Seconds,
        "Time spent waiting for the proxied upstream"
    );
    describe_counter!(
        "bridge_probe_total",
        Unit::Count,
        "Total upstream probe attempts"
    );
    describe_gauge!(
        "bridge_upstream_active",
        Unit::Count,
        "Per-upstream activity: 1=active 0=inactive"
    );
    describe_gauge!(
        "bridge_group_types",
        Unit::Count,
        "Number of group types currently routable"
    );
    describe_gauge!(
        "bridge_consolidation_epoch",
        Unit::Count,
        "Epoch of the published consolidated view"
    );
    describe_gauge!(
        "bridge_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "bridge_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}
