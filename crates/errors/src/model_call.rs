use thiserror::Error;

/// 外部模型调用的错误分类
///
/// 分类决定任务是否会被重试：只有传输层/可用性类错误可重试，
/// 请求错误与语义截断错误一律直接失败。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelCallError {
    #[error("模型调用超时 ({timeout_seconds}s)")]
    Timeout { timeout_seconds: u64 },

    #[error("连接模型服务失败: {0}")]
    Connection(String),

    #[error("模型服务限流 (HTTP 429)")]
    RateLimited,

    #[error("模型服务端错误 (HTTP {status})")]
    Server { status: u16 },

    #[error("模型请求被拒绝 (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    #[error("模型响应格式无效: {0}")]
    InvalidResponse(String),

    #[error(
        "模型推理令牌耗尽，返回空内容 (reasoning limit exhausted: reasoning_tokens={reasoning_tokens}, limit={limit})"
    )]
    ReasoningLimitExhausted { reasoning_tokens: u64, limit: u64 },

    #[error("模型返回了意外的空内容 (unexpected empty content, tool_calls={tool_calls})")]
    UnexpectedEmptyContent { tool_calls: usize },

    #[error("模型调用在 {attempts} 次尝试后失败: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<ModelCallError>,
    },

    #[error("模型调用已取消")]
    Cancelled,
}

impl ModelCallError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelCallError::Timeout { .. }
                | ModelCallError::Connection(_)
                | ModelCallError::RateLimited
                | ModelCallError::Server { .. }
                | ModelCallError::InvalidResponse(_)
        )
    }

    /// 根据HTTP状态码分类，仅用于非2xx响应
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => ModelCallError::RateLimited,
            500..=599 => ModelCallError::Server { status },
            _ => ModelCallError::Client {
                status,
                body: body.chars().take(200).collect(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelCallError::Timeout { .. } => "model_timeout",
            ModelCallError::Connection(_) => "model_connection_error",
            ModelCallError::RateLimited => "model_rate_limited",
            ModelCallError::Server { .. } => "model_server_error",
            ModelCallError::Client { .. } => "model_request_rejected",
            ModelCallError::InvalidResponse(_) => "model_invalid_response",
            ModelCallError::ReasoningLimitExhausted { .. } => "reasoning_limit_exhausted",
            ModelCallError::UnexpectedEmptyContent { .. } => "unexpected_empty_content",
            ModelCallError::RetriesExhausted { .. } => "retries_exhausted",
            ModelCallError::Cancelled => "cancelled",
        }
    }

    /// 重试耗尽时取出最后一次的真实原因
    pub fn root_cause(&self) -> &ModelCallError {
        match self {
            ModelCallError::RetriesExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}
