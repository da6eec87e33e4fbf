//! 外部推理模型客户端
//!
//! 每次尝试都有独立超时；可重试错误按 [`RetryPolicy`] 退避重试。
//! 推理模型在令牌耗尽时会返回 HTTP 200 和空内容，因此每个响应都要检查
//! 用量字段，空内容一律判为致命错误，绝不当作成功。

use async_trait::async_trait;
use screening_config::ModelConfig;
use screening_domain::{AnalysisType, EntityType, TokenUsage};
use screening_errors::{ModelCallError, ScreeningError, ScreeningResult};
use screening_observability::WorkerMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortSignal;
use crate::retry::{JitterSource, RandomJitter, RetryPolicy, Sleeper, TokioSleeper};

/// 一次分析所需的模型调用参数
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub job_id: String,
    pub model: String,
    pub subject_name: String,
    pub analysis_type: AnalysisType,
    pub entity_type: EntityType,
    /// 发送给模型的用户消息
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    /// 响应级别返回的来源链接
    pub sources: Vec<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableError,
    FatalError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::RetryableError => "retryable_error",
            AttemptOutcome::FatalError => "fatal_error",
        }
    }
}

/// 单次尝试的记录，只用于日志和指标，不持久化
#[derive(Debug, Clone)]
pub struct ModelCallAttempt {
    pub attempt: u32,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(
        &self,
        request: &AnalysisRequest,
        abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    tool_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// 聊天补全响应，字段全部宽松解析
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: Option<u64>,
}

impl ChatUsage {
    fn to_token_usage(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.unwrap_or(0),
            completion_tokens: self.completion_tokens.unwrap_or(0),
            reasoning_tokens: self
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens)
                .unwrap_or(0),
        }
    }
}

/// 通过校验的补全内容
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCompletion {
    pub content: String,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub sources: Vec<String>,
}

/// 检查补全响应，空内容按推理令牌用量区分两类致命错误
pub fn validate_completion(
    completion: ChatCompletion,
    reasoning_token_limit: u64,
) -> Result<ValidatedCompletion, ModelCallError> {
    let usage = completion
        .usage
        .as_ref()
        .map(ChatUsage::to_token_usage)
        .unwrap_or_default();

    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(ModelCallError::InvalidResponse(
            "响应中没有 choices".to_string(),
        ));
    };

    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        if usage.reasoning_tokens >= reasoning_token_limit {
            return Err(ModelCallError::ReasoningLimitExhausted {
                reasoning_tokens: usage.reasoning_tokens,
                limit: reasoning_token_limit,
            });
        }
        return Err(ModelCallError::UnexpectedEmptyContent {
            tool_calls: choice.message.tool_calls.map(|c| c.len()).unwrap_or(0),
        });
    }

    Ok(ValidatedCompletion {
        content,
        model: completion.model,
        usage,
        finish_reason: choice.finish_reason,
        sources: completion
            .sources
            .iter()
            .filter_map(source_link)
            .collect(),
    })
}

/// 来源可能是字符串，也可能是带 url/link/source 字段的对象
fn source_link(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Object(map) => ["url", "link", "source"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// 基于 reqwest 的模型客户端
pub struct HttpModelClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    tool_ids: Vec<String>,
    attempt_timeout: Duration,
    reasoning_token_limit: u64,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<WorkerMetrics>>,
}

impl HttpModelClient {
    pub fn new(config: &ModelConfig) -> ScreeningResult<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| ScreeningError::config_error(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            http_client,
            endpoint: config.chat_endpoint(),
            api_key: config.api_key.clone(),
            tool_ids: config.tool_ids.clone(),
            attempt_timeout: Duration::from_secs(config.timeout_seconds),
            reasoning_token_limit: config.reasoning_token_limit,
            policy: RetryPolicy::from_config(config),
            jitter: Arc::new(RandomJitter),
            sleeper: Arc::new(TokioSleeper),
            metrics: None,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn classify_transport(&self, err: reqwest::Error) -> ModelCallError {
        if err.is_timeout() {
            ModelCallError::Timeout {
                timeout_seconds: self.attempt_timeout.as_secs(),
            }
        } else {
            ModelCallError::Connection(err.to_string())
        }
    }

    /// 单次HTTP调用，超时覆盖发送和读取响应体
    async fn attempt_once(
        &self,
        request: &AnalysisRequest,
    ) -> Result<ValidatedCompletion, ModelCallError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream: false,
            tool_ids: &self.tool_ids,
        };

        let exchange = async {
            let response = self
                .http_client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let (status, text) = match tokio::time::timeout(self.attempt_timeout, exchange).await {
            Err(_) => {
                return Err(ModelCallError::Timeout {
                    timeout_seconds: self.attempt_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(self.classify_transport(e)),
            Ok(Ok(exchange)) => exchange,
        };

        if !status.is_success() {
            return Err(ModelCallError::from_status(status.as_u16(), &text));
        }

        let completion: ChatCompletion = serde_json::from_str(&text)
            .map_err(|e| ModelCallError::InvalidResponse(format!("无法解析模型响应: {e}")))?;

        validate_completion(completion, self.reasoning_token_limit)
    }

    fn record_attempt(&self, request: &AnalysisRequest, attempt: &ModelCallAttempt) {
        debug!(
            job_id = %request.job_id,
            model = %request.model,
            attempt = attempt.attempt,
            outcome = attempt.outcome.as_str(),
            elapsed_ms = attempt.elapsed.as_millis() as u64,
            reasoning_tokens = attempt.usage.map(|u| u.reasoning_tokens),
            "模型调用尝试结束"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_model_attempt(&request.model, attempt.outcome.as_str(), attempt.elapsed);
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    #[instrument(skip_all, fields(job_id = %request.job_id, model = %request.model, analysis_type = %request.analysis_type))]
    async fn call(
        &self,
        request: &AnalysisRequest,
        abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError> {
        let started = Instant::now();
        let mut delays = self.policy.schedule(self.jitter.as_ref());
        let mut attempt: u32 = 0;

        loop {
            if abort.is_aborted() {
                return Err(ModelCallError::Cancelled);
            }
            attempt += 1;
            let attempt_started = Instant::now();

            let result = tokio::select! {
                result = self.attempt_once(request) => result,
                _ = abort.aborted() => return Err(ModelCallError::Cancelled),
            };

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(e) if e.is_retryable() => AttemptOutcome::RetryableError,
                Err(_) => AttemptOutcome::FatalError,
            };
            self.record_attempt(
                request,
                &ModelCallAttempt {
                    attempt,
                    elapsed: attempt_started.elapsed(),
                    outcome,
                    usage: result.as_ref().ok().map(|c| c.usage),
                },
            );

            let error = match result {
                Ok(completion) => {
                    info!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        reasoning_tokens = completion.usage.reasoning_tokens,
                        "模型调用成功"
                    );
                    return Ok(ModelResponse {
                        content: completion.content,
                        model: completion.model.unwrap_or_else(|| request.model.clone()),
                        usage: completion.usage,
                        finish_reason: completion.finish_reason,
                        sources: completion.sources,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) if !e.is_retryable() => {
                    warn!(attempt, error = %e, kind = e.kind(), "模型调用遇到不可重试的错误");
                    return Err(e);
                }
                Err(e) => e,
            };

            let Some(delay) = delays.next() else {
                warn!(attempt, error = %error, "模型调用重试次数已用尽");
                return Err(ModelCallError::RetriesExhausted {
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            };

            warn!(
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "模型调用失败，等待后重试"
            );
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = abort.aborted() => return Err(ModelCallError::Cancelled),
            }
        }
    }
}
