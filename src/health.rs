use crate::main_helper::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub agent: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when the database answers and an agent endpoint is configured.
pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ok = match crate::db::ping(state.store.pool()).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Readiness check: DB error: {}", e.inner);
            false
        }
    };

    let agent_ok = !state.endpoints.default.trim().is_empty();
    if !agent_ok {
        tracing::error!("Readiness check: no agent endpoint configured");
    }

    let ready = db_ok && agent_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            agent: if agent_ok { "ok" } else { "missing" }.to_string(),
        }),
    )
}
