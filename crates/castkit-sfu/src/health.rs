//! Health and egress status endpoints for load balancers and monitoring.

use crate::egress::EgressStatus;
use crate::state::SfuState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
    peers: usize,
    producers: usize,
}

/// Health check router.
pub fn router() -> Router<Arc<SfuState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/egress", get(egress_status))
}

async fn health_check(State(state): State<Arc<SfuState>>) -> Json<HealthResponse> {
    let engine_ok = *state.engine.liveness().borrow();
    let peers = state.registry.read().await.len();
    let producers = state.directory.read().await.len();

    Json(HealthResponse {
        status: if engine_ok {
            "healthy".into()
        } else {
            "degraded".into()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime().as_secs(),
        peers,
        producers,
    })
}

async fn egress_status(State(state): State<Arc<SfuState>>) -> Result<Json<EgressStatus>, StatusCode> {
    let Some(egress) = &state.egress else {
        return Err(StatusCode::NOT_FOUND);
    };
    egress
        .status()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
