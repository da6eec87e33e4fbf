use thiserror::Error;

mod model_call;

pub use model_call::ModelCallError;

#[derive(Debug, Error)]
pub enum ScreeningError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务存储错误: {0}")]
    JobStore(String),
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务校验失败: {0}")]
    Validation(String),
    #[error(transparent)]
    ModelCall(#[from] ModelCallError),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ScreeningResult<T> = Result<T, ScreeningError>;

impl ScreeningError {
    pub fn job_store<S: Into<String>>(msg: S) -> Self {
        Self::JobStore(msg.into())
    }
    pub fn message_queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// 写入任务记录 `error` 字段的稳定分类码
    pub fn kind(&self) -> &'static str {
        match self {
            ScreeningError::Database(_) | ScreeningError::JobStore(_) => "job_store_error",
            ScreeningError::MessageQueue(_) => "message_queue_error",
            ScreeningError::Serialization(_) => "serialization_error",
            ScreeningError::Configuration(_) => "configuration_error",
            ScreeningError::Validation(_) => "validation_error",
            ScreeningError::ModelCall(e) => e.kind(),
            ScreeningError::Timeout(_) => "timeout",
            ScreeningError::Internal(_) => "internal_error",
        }
    }

    /// 面向轮询方的错误描述，带分类前缀
    pub fn job_error_message(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}

impl From<serde_json::Error> for ScreeningError {
    fn from(err: serde_json::Error) -> Self {
        ScreeningError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ScreeningError {
    fn from(err: anyhow::Error) -> Self {
        ScreeningError::Internal(err.to_string())
    }
}
