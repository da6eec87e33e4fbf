use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

use screening_observability::WorkerMetrics;
use screening_worker::{AbortSignal, FlowGate, MessageDispatcher, WorkerActivity};

use crate::handlers::{
    health::health_check,
    metrics::{get_metrics, get_prometheus_metrics},
    push::process_push,
    root::service_descriptor,
};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub hostname: String,
}

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub info: ServiceInfo,
    pub activity: Arc<WorkerActivity>,
    pub metrics: Arc<WorkerMetrics>,
    /// 未安装 recorder 时为空
    pub prometheus: Option<PrometheusHandle>,
    /// 为空时不注册 `/process`
    pub dispatcher: Option<Arc<MessageDispatcher>>,
    /// 与拉取循环共用，推送消息同样计入在途上限
    pub gate: Arc<FlowGate>,
    pub abort: AbortSignal,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(service_descriptor))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/metrics/prometheus", get(get_prometheus_metrics));

    if state.dispatcher.is_some() {
        router = router.route("/process", post(process_push));
    }

    router.with_state(state)
}
