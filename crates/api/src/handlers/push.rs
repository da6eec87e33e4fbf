use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use screening_domain::Delivery;
use screening_worker::AckDecision;

use crate::{error::ApiError, routes::AppState};

/// 推送订阅的请求体
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    /// base64 编码的任务消息
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, alias = "messageId")]
    pub message_id: Option<String>,
}

fn acknowledged(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "acknowledged", "reason": reason })),
    )
}

/// 2xx 表示确认，503 让推送方重新投递
pub async fn process_push(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let dispatcher = state
        .dispatcher
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("推送入口未启用".to_string()))?;

    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "推送请求体无法解析，确认后丢弃");
            return Ok(acknowledged("invalid_envelope"));
        }
    };

    let Some(data) = envelope
        .message
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    else {
        info!("推送消息没有数据，忽略");
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
    };

    let payload = match STANDARD.decode(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "推送数据不是有效的 base64，确认后丢弃");
            return Ok(acknowledged("undecodable"));
        }
    };

    let delivery_id = envelope
        .message
        .message_id
        .unwrap_or_else(|| format!("push-{}", uuid::Uuid::new_v4()));
    let subscription = envelope.subscription.as_deref().unwrap_or("-");
    debug!(delivery_id = %delivery_id, subscription, size = payload.len(), "收到推送消息");

    let Some(permit) = state.gate.try_admit(payload.len()) else {
        warn!(
            delivery_id = %delivery_id,
            subscription,
            in_flight = state.gate.in_flight(),
            closed = state.gate.is_closed(),
            "在途消息已达上限或正在关闭，推送消息稍后重试"
        );
        state.metrics.record_redelivery_requested();
        return Err(ApiError::ServiceUnavailable(format!(
            "消息 {delivery_id} 暂时无法处理"
        )));
    };
    state.metrics.set_in_flight(state.gate.in_flight());

    let delivery = Delivery::new(delivery_id, payload);
    let decision = dispatcher.handle(&delivery, &state.abort).await;
    drop(permit);
    state.metrics.set_in_flight(state.gate.in_flight());

    match decision {
        AckDecision::Ack => Ok(acknowledged("processed")),
        AckDecision::Nack => Err(ApiError::ServiceUnavailable(format!(
            "消息 {} 需要重新投递",
            delivery.delivery_id
        ))),
    }
}
