use std::sync::atomic::Ordering;

use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let queue = state.exec.counters().await.unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "activeConnections": state.active_connections.load(Ordering::SeqCst),
            "activeDocuments": state.hubs.active_documents().await,
            "queue": {
                "queued": queue.queued,
                "processing": queue.processing,
            },
            "sandboxAvailable": state.exec.sandbox().is_available(),
        })),
    )
}
