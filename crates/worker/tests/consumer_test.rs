use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use screening_domain::{
    AnalysisType, Delivery, EntityType, Job, JobMessage, JobPublisher, JobRepository, JobStatus,
    TokenUsage,
};
use screening_errors::ModelCallError;
use screening_infrastructure::{InMemoryJobRepository, InMemoryMessageQueue};
use screening_worker::{
    AbortSignal, AckDecision, AnalysisRequest, FlowControl, ModelClient, ModelResponse,
    WorkerService,
};

/// 固定响应的模型客户端，记录最大并发调用数
struct CountingModelClient {
    delay: Duration,
    wait_for_abort: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingModelClient {
    fn responding_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            wait_for_abort: false,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            wait_for_abort: true,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelClient for CountingModelClient {
    async fn call(
        &self,
        request: &AnalysisRequest,
        abort: &AbortSignal,
    ) -> Result<ModelResponse, ModelCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let result = if self.wait_for_abort {
            abort.aborted().await;
            Err(ModelCallError::Cancelled)
        } else {
            tokio::time::sleep(self.delay).await;
            Ok(ModelResponse {
                content: r#"{"status": "negative", "summary": "Nothing found"}"#.to_string(),
                model: request.model.clone(),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
                sources: Vec::new(),
                attempts: 1,
                elapsed: self.delay,
            })
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

async fn seed_and_publish(
    repository: &InMemoryJobRepository,
    queue: &InMemoryMessageQueue,
    job_id: &str,
) {
    repository
        .create(&Job::new(
            job_id,
            AnalysisType::NegativeNews,
            EntityType::Person,
            "Jane Doe",
        ))
        .await
        .unwrap();
    queue
        .publish(&JobMessage::text_analysis(
            job_id,
            AnalysisType::NegativeNews,
            EntityType::Person,
            "Jane Doe",
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_consumes_until_subscription_closes() {
    let queue = Arc::new(InMemoryMessageQueue::new("jobs"));
    let repository = Arc::new(InMemoryJobRepository::new());
    let client = CountingModelClient::responding_after(Duration::from_millis(10));

    seed_and_publish(&repository, &queue, "J1").await;
    seed_and_publish(&repository, &queue, "J2").await;
    queue.publish_raw(b"{broken".to_vec()).unwrap();
    queue.close();

    let service = WorkerService::builder("worker-test", queue.clone(), repository.clone(), client.clone())
        .flow_control(FlowControl::new(2, 1024 * 1024))
        .build();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::time::timeout(Duration::from_secs(5), service.run(shutdown_rx))
        .await
        .expect("consumer should stop when the queue is drained")
        .unwrap();

    assert_eq!(queue.acked_ids().len(), 3);
    assert!(queue.nacked_ids().is_empty());
    assert_eq!(queue.in_flight_count(), 0);
    for job_id in ["J1", "J2"] {
        let job = repository.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    let status = service.activity().status();
    assert!(!status.running);
    assert_eq!(status.processed_jobs, 2);
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_flow_control_bounds_concurrency() {
    let queue = Arc::new(InMemoryMessageQueue::new("jobs"));
    let repository = Arc::new(InMemoryJobRepository::new());
    let client = CountingModelClient::responding_after(Duration::from_millis(40));

    for i in 0..6 {
        seed_and_publish(&repository, &queue, &format!("J{i}")).await;
    }
    queue.close();

    let service = WorkerService::builder("worker-test", queue.clone(), repository.clone(), client.clone())
        .flow_control(FlowControl::new(2, 1024 * 1024))
        .build();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::time::timeout(Duration::from_secs(5), service.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(client.calls.load(Ordering::SeqCst), 6);
    assert!(client.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(queue.acked_ids().len(), 6);
}

#[tokio::test]
async fn test_shutdown_aborts_stuck_jobs_and_nacks() {
    let queue = Arc::new(InMemoryMessageQueue::new("jobs"));
    let repository = Arc::new(InMemoryJobRepository::new());
    let client = CountingModelClient::hanging();
    seed_and_publish(&repository, &queue, "J1").await;

    let service = Arc::new(
        WorkerService::builder("worker-test", queue.clone(), repository.clone(), client.clone())
            .flow_control(FlowControl::new(4, 1024 * 1024))
            .shutdown_timeouts(Duration::from_millis(50), Duration::from_secs(2))
            .build(),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = tokio::spawn({
        let service = service.clone();
        async move { service.run(shutdown_rx).await }
    });

    let activity = service.activity();
    tokio::time::timeout(Duration::from_secs(5), async {
        while activity.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job should become active");

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("shutdown should finish")
        .unwrap()
        .unwrap();

    assert!(service.abort_handle().is_aborted());
    assert_eq!(queue.nacked_ids().len(), 1);
    assert!(queue.acked_ids().is_empty());
    let job = repository.get("J1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(activity.active_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_jobs_admitted_outside_the_consumer() {
    let queue = Arc::new(InMemoryMessageQueue::new("jobs"));
    let repository = Arc::new(InMemoryJobRepository::new());
    let client = CountingModelClient::hanging();
    repository
        .create(&Job::new(
            "P1",
            AnalysisType::NegativeNews,
            EntityType::Person,
            "Jane Doe",
        ))
        .await
        .unwrap();

    let service = Arc::new(
        WorkerService::builder("worker-test", queue.clone(), repository.clone(), client.clone())
            .flow_control(FlowControl::new(2, 1024 * 1024))
            .shutdown_timeouts(Duration::from_millis(50), Duration::from_secs(2))
            .build(),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = tokio::spawn({
        let service = service.clone();
        async move { service.run(shutdown_rx).await }
    });

    // 模拟推送入口：先拿闸门许可，再交给同一个分发器
    let gate = service.flow_gate();
    let payload = JobMessage::text_analysis(
        "P1",
        AnalysisType::NegativeNews,
        EntityType::Person,
        "Jane Doe",
    )
    .encode()
    .unwrap();
    let permit = gate.try_admit(payload.len()).unwrap();
    let pushed = tokio::spawn({
        let dispatcher = service.dispatcher();
        let signal = service.abort_handle().signal();
        async move {
            let _permit = permit;
            dispatcher
                .handle(&Delivery::new("push-1", payload), &signal)
                .await
        }
    });

    let activity = service.activity();
    tokio::time::timeout(Duration::from_secs(5), async {
        while activity.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pushed job should become active");

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("shutdown should wait for the pushed job")
        .unwrap()
        .unwrap();

    assert!(service.abort_handle().is_aborted());
    assert!(gate.is_closed());
    assert_eq!(gate.in_flight(), 0);
    assert!(gate.try_admit(1).is_none());
    assert_eq!(pushed.await.unwrap(), AckDecision::Nack);
    let job = repository.get("P1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}
