//! # Screening API
//!
//! worker 进程的轻量 HTTP 面：健康检查、处理指标和推送投递入口。
//!
//! ## API 端点
//!
//! - `GET /` - 服务描述
//! - `GET /health` - 运行状态，未运行时返回 `degraded`
//! - `GET /metrics` - worker 状态和处理指标
//! - `GET /metrics/prometheus` - Prometheus 文本格式
//! - `POST /process` - 推送投递，走与队列消费相同的分发路径

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};

pub use routes::{create_routes, AppState, ServiceInfo};
pub use server::serve;

/// 创建完整的API应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
