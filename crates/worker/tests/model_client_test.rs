use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockito::Matcher;
use serde_json::json;

use screening_config::ModelConfig;
use screening_domain::{AnalysisType, EntityType};
use screening_errors::ModelCallError;
use screening_worker::{
    AbortHandle, AbortSignal, AnalysisRequest, FixedJitter, HttpModelClient, ModelClient, Sleeper,
};

const CHAT_PATH: &str = "/api/chat/completions";

/// 记录每次退避时长，不真正睡眠
#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

fn config(base_url: String) -> ModelConfig {
    ModelConfig {
        base_url,
        api_key: "test-key".to_string(),
        max_retries: 3,
        base_delay_ms: 1000,
        max_delay_seconds: 60,
        reasoning_token_limit: 2000,
        ..ModelConfig::default()
    }
}

fn client(config: &ModelConfig, sleeper: Arc<RecordingSleeper>) -> HttpModelClient {
    HttpModelClient::new(config)
        .unwrap()
        .with_sleeper(sleeper)
        .with_jitter(Arc::new(FixedJitter(1.0)))
}

fn request() -> AnalysisRequest {
    AnalysisRequest {
        job_id: "J1".to_string(),
        model: "negative-news".to_string(),
        subject_name: "Jane Doe".to_string(),
        analysis_type: AnalysisType::NegativeNews,
        entity_type: EntityType::Person,
        prompt: "Jane Doe".to_string(),
    }
}

fn completion_body(content: &str, reasoning_tokens: u64) -> String {
    json!({
        "model": "negative-news",
        "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": 20,
            "completion_tokens": reasoning_tokens + 10,
            "completion_tokens_details": {"reasoning_tokens": reasoning_tokens}
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_success_sends_expected_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(json!({
            "model": "negative-news",
            "messages": [{"role": "user", "content": "Jane Doe"}],
            "stream": false,
            "tool_ids": ["web_search"]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion_body(r#"{"status":"clean"}"#, 400))
        .expect(1)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let response = client.call(&request(), &AbortSignal::never()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.content, r#"{"status":"clean"}"#);
    assert_eq!(response.attempts, 1);
    assert_eq!(response.usage.reasoning_tokens, 400);
    assert_eq!(response.usage.prompt_tokens, 20);
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_unauthorized_is_fatal_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .with_status(401)
        .with_body(r#"{"detail":"invalid token"}"#)
        .expect(1)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(err, ModelCallError::Client { status: 401, .. }));
    assert!(!err.is_retryable());
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_server_error_exhausts_retries() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .with_status(503)
        .with_body("unavailable")
        .expect(4)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    mock.assert_async().await;
    match err {
        ModelCallError::RetriesExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(*last_error, ModelCallError::Server { status: 503 });
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let delays = sleeper.delays();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_rate_limit_then_success() {
    let mut server = mockito::Server::new_async().await;
    let limited = server
        .mock("POST", CHAT_PATH)
        .with_status(429)
        .expect(1)
        .create_async()
        .await;
    let ok = server
        .mock("POST", CHAT_PATH)
        .with_status(200)
        .with_body(completion_body(r#"{"status":"found"}"#, 100))
        .expect(1)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let response = client.call(&request(), &AbortSignal::never()).await.unwrap();

    limited.assert_async().await;
    ok.assert_async().await;
    assert_eq!(response.attempts, 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_reasoning_limit_exhausted_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .with_status(200)
        .with_body(completion_body("", 2000))
        .expect(1)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert_eq!(
        err,
        ModelCallError::ReasoningLimitExhausted {
            reasoning_tokens: 2000,
            limit: 2000
        }
    );
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_empty_content_below_limit_is_distinct_fatal_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .with_status(200)
        .with_body(completion_body("", 500))
        .expect(1)
        .create_async()
        .await;

    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config(server.url()), sleeper.clone());
    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert_eq!(err, ModelCallError::UnexpectedEmptyContent { tool_calls: 0 });
    assert_eq!(err.kind(), "unexpected_empty_content");
}

#[tokio::test]
async fn test_malformed_body_is_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", CHAT_PATH)
        .with_status(200)
        .with_body("<html>gateway</html>")
        .expect(2)
        .create_async()
        .await;

    let mut config = config(server.url());
    config.max_retries = 1;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config, sleeper.clone());
    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(
        err.root_cause(),
        ModelCallError::InvalidResponse(_)
    ));
    assert_eq!(sleeper.delays().len(), 1);
}

/// 接受连接但从不响应
async fn silent_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{address}")
}

#[tokio::test]
async fn test_attempt_timeout_is_retryable() {
    let mut config = config(silent_server().await);
    config.max_retries = 1;
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config, sleeper.clone()).with_attempt_timeout(Duration::from_millis(100));

    let err = client
        .call(&request(), &AbortSignal::never())
        .await
        .unwrap_err();

    match err {
        ModelCallError::RetriesExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last_error, ModelCallError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(sleeper.delays().len(), 1);
}

#[tokio::test]
async fn test_abort_cancels_in_flight_attempt() {
    let config = config(silent_server().await);
    let sleeper = Arc::new(RecordingSleeper::default());
    let client = client(&config, sleeper).with_attempt_timeout(Duration::from_secs(30));

    let handle = AbortHandle::new();
    let signal = handle.signal();
    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), client.call(&request(), &signal))
        .await
        .expect("abort should end the call")
        .unwrap_err();
    aborter.await.unwrap();
    assert_eq!(err, ModelCallError::Cancelled);
}
