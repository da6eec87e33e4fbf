use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

pub async fn service_descriptor(State(state): State<AppState>) -> Json<Value> {
    let mut endpoints = vec!["GET /health", "GET /metrics", "GET /metrics/prometheus"];
    if state.dispatcher.is_some() {
        endpoints.push("POST /process");
    }

    Json(json!({
        "service": state.info.service,
        "version": state.info.version,
        "hostname": state.info.hostname,
        "worker_id": state.activity.worker_id(),
        "endpoints": endpoints,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
