use crate::upstream::UpstreamStatus;
use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct RootResponse {
    pub ok: bool,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub upstream: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub sessions: usize,
    pub upstream_requests: u64,
    pub upstream_failures: u64,
    pub consecutive_failures: u32,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Always answers 200; an unreachable upstream is reported as `degraded`.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, upstream, details) = match state.upstream.check().await {
        UpstreamStatus::Connected => ("ok", "connected", None),
        UpstreamStatus::Error(code) => {
            tracing::warn!("Health check - upstream answered {}", code);
            ("degraded", "error", Some(format!("upstream returned status {}", code)))
        }
        UpstreamStatus::Disconnected(reason) => ("degraded", "disconnected", Some(reason)),
    };

    let (upstream_requests, upstream_failures, consecutive_failures) = state.health.snapshot();
    Json(HealthResponse {
        status,
        upstream,
        details,
        sessions: state.sessions.len(),
        upstream_requests,
        upstream_failures,
        consecutive_failures,
        checked_at: chrono::Utc::now(),
    })
}
