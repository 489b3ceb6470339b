//! Minimal admin HTTP surface: health and a metrics snapshot. The embedded
//! dashboard and a full scrape-and-render pipeline are out of scope; this
//! only exposes what the core already tracks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::anyproxy::metrics::Metrics;

pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_snapshot))
        .with_state(metrics);

    tracing::info!(admin_addr = %addr, "admin: listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics_snapshot(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (StatusCode::OK, Json(metrics.snapshot()))
}
