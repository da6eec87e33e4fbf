use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    routes::AppState,
};

pub async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "worker": state.activity.status(),
        "processing": state.metrics.snapshot(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn get_prometheus_metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("未启用 Prometheus 指标".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
