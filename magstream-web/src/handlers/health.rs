//! Liveness endpoint.

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use crate::server::AppState;

/// Health check payload
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` while the server answers
    pub status: &'static str,
    /// Name of the content engine in use
    pub engine: &'static str,
    /// Seconds since the server started
    pub uptime_seconds: u64,
    /// Current time, RFC 3339
    pub timestamp: String,
}

/// Reports server liveness.
pub async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.streamer.resolver().engine().name(),
        uptime_seconds: state.server_started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
