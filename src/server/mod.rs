pub mod auth;
pub mod handlers;
pub mod state;

use crate::config::Config;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use state::AppState;
use std::sync::OnceLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus recorder. Installed lazily so building multiple
/// routers (tests) never double-installs.
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Build the full router with shared state.
pub async fn build_router(config: Config) -> Router {
    let state = AppState::new(config).await;

    // Arm monitors configured at boot
    for channel_id in &state.config.monitor_channels {
        state.monitors.arm(channel_id);
    }

    // CORS: permissive — manifests and segments must be reachable from any
    // web player origin (HLS.js, video.js, Safari)
    let cors = CorsLayer::very_permissive();

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route(
            "/metrics",
            get({
                let handle = prometheus_handle();
                move || {
                    let handle = handle.clone();
                    handlers::metrics::serve_metrics(handle)
                }
            }),
        )
        // Operator control plane
        .route("/cue", post(handlers::cue::handle_cue))
        // Demo origin: synthetic live variants with SCTE-35 markers
        .route("/demo/master.m3u8", get(handlers::demo::serve_demo_master))
        .route("/demo/{variant}", get(handlers::demo::serve_demo_variant))
        // Legacy query-string form
        .route("/manifest", get(handlers::manifest::serve_manifest_legacy))
        // Viewer manifest/segment pipeline
        .route(
            "/{org}/{channel}/{variant}",
            get(handlers::manifest::serve_manifest),
        )
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.port;
    let base_url = config.base_url.clone();

    let app = build_router(config).await;

    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}. Is port {} already in use?", addr, e, port);
            return Err(e.into());
        }
    };

    info!("Server bound to {}", addr);
    info!("Public URL: {}", base_url);
    info!("  Health:   {}/health", base_url);
    info!("  Metrics:  {}/metrics", base_url);
    info!("  Manifest: {}/{{org}}/{{channel}}/{{variant}}.m3u8", base_url);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
