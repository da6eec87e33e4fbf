use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 消费循环运行中为 healthy，否则 degraded 并返回 503
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let worker = state.activity.status();
    let (status_code, status) = if worker.running {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": state.info.service,
            "version": state.info.version,
            "worker": worker,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}
