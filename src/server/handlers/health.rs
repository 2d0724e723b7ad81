use axum::response::IntoResponse;

/// Liveness probe. Plain "OK" keeps load balancers and uptime checks happy.
pub async fn health_check() -> impl IntoResponse {
    "OK"
}
