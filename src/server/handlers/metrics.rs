use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Prometheus scrape endpoint.
pub async fn serve_metrics(handle: PrometheusHandle) -> impl IntoResponse {
    handle.render()
}
