use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tower::ServiceExt;

use screening_api::{create_app, AppState, ServiceInfo};
use screening_domain::{AnalysisType, EntityType, Job, JobRepository, JobStatus, TokenUsage};
use screening_errors::ModelCallError;
use screening_infrastructure::InMemoryJobRepository;
use screening_observability::WorkerMetrics;
use screening_worker::{
    AbortSignal, AnalysisRequest, FlowControl, FlowGate, JobStateTracker, MessageDispatcher,
    ModelClient, ModelResponse, TextAnalysisProcessor, WorkerActivity,
};
use tokio::sync::Semaphore;

fn clean_response(model: &str) -> ModelResponse {
    ModelResponse {
        content: r#"{"status": "clean", "summary": "No adverse media"}"#.to_string(),
        model: model.to_string(),
        usage: TokenUsage::default(),
        finish_reason: Some("stop".to_string()),
        sources: Vec::new(),
        attempts: 1,
        elapsed: Duration::from_millis(5),
    }
}

struct StaticModelClient;

#[async_trait]
impl ModelClient for StaticModelClient {
    async fn call(
        &self,
        request: &AnalysisRequest,
        _abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError> {
        Ok(clean_response(&request.model))
    }
}

/// 阻塞到测试放行，记录同时进入调用的数量
struct GatedModelClient {
    release: Semaphore,
    current: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicUsize,
}

impl GatedModelClient {
    fn new() -> Self {
        Self {
            release: Semaphore::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for GatedModelClient {
    async fn call(
        &self,
        request: &AnalysisRequest,
        _abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(clean_response(&request.model))
    }
}

/// 模拟关闭时被中止的调用
struct CancelledModelClient;

#[async_trait]
impl ModelClient for CancelledModelClient {
    async fn call(
        &self,
        _request: &AnalysisRequest,
        _abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError> {
        Err(ModelCallError::Cancelled)
    }
}

struct TestApp {
    router: Router,
    repository: Arc<InMemoryJobRepository>,
    activity: Arc<WorkerActivity>,
}

fn test_app(push_enabled: bool, prometheus: bool) -> TestApp {
    test_app_with_client(push_enabled, prometheus, Arc::new(StaticModelClient))
}

fn test_app_with_client(
    push_enabled: bool,
    prometheus: bool,
    client: Arc<dyn ModelClient>,
) -> TestApp {
    test_app_with_gate(
        push_enabled,
        prometheus,
        client,
        Arc::new(FlowGate::default()),
    )
}

fn test_app_with_gate(
    push_enabled: bool,
    prometheus: bool,
    client: Arc<dyn ModelClient>,
    gate: Arc<FlowGate>,
) -> TestApp {
    let repository = Arc::new(InMemoryJobRepository::new());
    let metrics = Arc::new(WorkerMetrics::new(100, 100));
    let activity = Arc::new(WorkerActivity::new("worker-api-test", "jobs", 4));
    let dispatcher = push_enabled.then(|| {
        Arc::new(MessageDispatcher::new(
            TextAnalysisProcessor::new(
                JobStateTracker::new(repository.clone()),
                client,
                metrics.clone(),
            ),
            activity.clone(),
            metrics.clone(),
        ))
    });

    let state = AppState {
        info: ServiceInfo {
            service: "text-analysis-worker".to_string(),
            version: "test".to_string(),
            hostname: "localhost".to_string(),
        },
        activity: activity.clone(),
        metrics,
        prometheus: prometheus.then(|| PrometheusBuilder::new().build_recorder().handle()),
        dispatcher,
        gate,
        abort: AbortSignal::never(),
    };

    TestApp {
        router: create_app(state),
        repository,
        activity,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(
        router,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn push(router: &Router, envelope: Value) -> (StatusCode, Value) {
    let (status, body) = send(
        router,
        Request::builder()
            .method("POST")
            .uri("/process")
            .header("content-type", "application/json")
            .body(Body::from(envelope.to_string()))
            .unwrap(),
    )
    .await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_service_descriptor() {
    let app = test_app(true, false);
    let (status, body) = get_json(&app.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "text-analysis-worker");
    assert_eq!(body["worker_id"], "worker-api-test");
    assert!(body["endpoints"]
        .as_array()
        .unwrap()
        .contains(&json!("POST /process")));
}

#[tokio::test]
async fn test_health_reflects_running_state() {
    let app = test_app(false, false);

    let (status, body) = get_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");

    app.activity.set_running(true);
    let (status, body) = get_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["worker"]["running"], true);
    assert_eq!(body["worker"]["max_workers"], 4);
    assert_eq!(body["worker"]["subscription"], "jobs");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = test_app(false, false);
    let (status, body) = get_json(&app.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker"]["processed_jobs"], 0);
    assert_eq!(body["processing"]["total_jobs"], 0);
}

#[tokio::test]
async fn test_prometheus_endpoint() {
    let disabled = test_app(false, false);
    let (status, _) = send(
        &disabled.router,
        Request::builder()
            .uri("/metrics/prometheus")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let enabled = test_app(false, true);
    let (status, _) = send(
        &enabled.router,
        Request::builder()
            .uri("/metrics/prometheus")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn seed(repository: &InMemoryJobRepository, job_id: &str) {
    repository
        .create(&Job::new(
            job_id,
            AnalysisType::NegativeNews,
            EntityType::Person,
            "Jane Doe",
        ))
        .await
        .unwrap();
}

async fn seed_j1(repository: &InMemoryJobRepository) {
    seed(repository, "J1").await;
}

fn envelope(job_id: &str, message_id: &str) -> Value {
    let payload = json!({
        "job_id": job_id,
        "job_type": "text_analysis",
        "analysis_type": "negative-news",
        "entity_type": "person",
        "subject_name": "Jane Doe"
    });
    json!({"message": {"data": STANDARD.encode(payload.to_string()), "message_id": message_id}})
}

fn j1_envelope() -> Value {
    envelope("J1", "m-1")
}

#[tokio::test]
async fn test_push_processes_job() {
    let app = test_app(true, false);
    seed_j1(&app.repository).await;

    let (status, body) = push(&app.router, j1_envelope()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "acknowledged");
    let job = app.repository.get("J1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(app.activity.status().processed_jobs, 1);
}

#[tokio::test]
async fn test_push_empty_and_undecodable_data_are_acknowledged() {
    let app = test_app(true, false);

    let (status, body) = push(&app.router, json!({"message": {"data": ""}})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    let (status, body) = push(&app.router, json!({"message": {"data": "%%%not-base64"}})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "undecodable");

    let (status, body) = push(&app.router, json!({"unexpected": true})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "invalid_envelope");

    let garbage = STANDARD.encode("not json at all");
    let (status, _) = push(&app.router, json!({"message": {"data": garbage}})).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_push_disabled_route_is_absent() {
    let app = test_app(false, false);
    let (status, _) = send(
        &app.router,
        Request::builder()
            .method("POST")
            .uri("/process")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_push_redelivery_requested_returns_503() {
    let app = test_app_with_client(true, false, Arc::new(CancelledModelClient));
    seed_j1(&app.repository).await;

    let (status, body) = push(&app.router, j1_envelope()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "SERVICE_UNAVAILABLE");
    let job = app.repository.get("J1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_push_respects_shared_flow_limit() {
    let client = Arc::new(GatedModelClient::new());
    let gate = Arc::new(FlowGate::new(FlowControl::new(2, 1024)));
    let app = test_app_with_gate(true, false, client.clone(), gate.clone());
    for i in 0..10 {
        seed(&app.repository, &format!("J{i}")).await;
    }

    let requests: Vec<_> = (0..10)
        .map(|i| {
            let router = app.router.clone();
            let body = envelope(&format!("J{i}"), &format!("m-{i}"));
            tokio::spawn(async move { push(&router, body).await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while requests.iter().filter(|r| r.is_finished()).count() < 8
            || client.entered.load(Ordering::SeqCst) < 2
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(gate.in_flight(), 2);

    client.release.add_permits(10);
    let mut accepted = 0;
    let mut rejected = 0;
    for request in requests {
        let (status, _) = request.await.unwrap();
        match status {
            StatusCode::OK => accepted += 1,
            StatusCode::SERVICE_UNAVAILABLE => rejected += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(accepted, 2);
    assert_eq!(rejected, 8);
    assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    assert_eq!(gate.in_flight(), 0);
}

#[tokio::test]
async fn test_push_rejected_after_gate_closes() {
    let gate = Arc::new(FlowGate::default());
    let app = test_app_with_gate(true, false, Arc::new(StaticModelClient), gate.clone());
    seed_j1(&app.repository).await;

    gate.close();
    let (status, _) = push(&app.router, j1_envelope()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let job = app.repository.get("J1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Submitted);
}
