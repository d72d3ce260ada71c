//! Prometheus metrics export (`GET /_matrix/metrics`).

use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "http_requests_total",
            "Total number of ingress HTTP requests"
        );
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "Ingress HTTP request duration in seconds"
        );
        metrics::describe_counter!(
            "pushkin_dispatches_total",
            "Dispatch attempts by pushkin and outcome"
        );
        metrics::describe_counter!(
            "pushkin_token_refresh_total",
            "Auth token refresh attempts by pushkin and result"
        );
        metrics::describe_gauge!(
            "pushkin_inflight_permits",
            "Number of outbound requests currently holding a concurrency permit"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus text-exposition endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    (StatusCode::OK, handle.render())
}

/// Middleware recording overall ingress request latency/count.
pub async fn track_request_metrics(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    metrics::counter!("http_requests_total").increment(1);
    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    response
}

/// Record a single device dispatch outcome for a given pushkin identity.
pub fn record_dispatch(pushkin_id: &str, outcome: &str) {
    metrics::counter!("pushkin_dispatches_total", "pushkin" => pushkin_id.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record an auth-token refresh attempt for a given pushkin identity.
pub fn record_token_refresh(pushkin_id: &str, result: &str) {
    metrics::counter!("pushkin_token_refresh_total", "pushkin" => pushkin_id.to_string(), "result" => result.to_string())
        .increment(1);
}

/// Report the number of permits currently checked out for a pushkin.
pub fn record_inflight_permits(pushkin_id: &str, count: usize) {
    metrics::gauge!("pushkin_inflight_permits", "pushkin" => pushkin_id.to_string())
        .set(count as f64);
}
