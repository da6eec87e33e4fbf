use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use screening_config::AppConfig;
use screening_domain::{JobRepository, MessageSubscription};
use screening_errors::ScreeningResult;
use screening_observability::WorkerMetrics;

use crate::abort::AbortHandle;
use crate::activity::WorkerActivity;
use crate::consumer::QueueConsumer;
use crate::dispatcher::MessageDispatcher;
use crate::flow::{FlowControl, FlowGate};
use crate::model_client::ModelClient;
use crate::pipeline::TextAnalysisProcessor;
use crate::tracker::JobStateTracker;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_id: String,
    subscription: Arc<dyn MessageSubscription>,
    job_repository: Arc<dyn JobRepository>,
    model_client: Arc<dyn ModelClient>,
    metrics: Option<Arc<WorkerMetrics>>,
    flow: FlowControl,
    model_overrides: HashMap<String, String>,
    drain_timeout: Duration,
    abort_grace: Duration,
    reconnect_delay: Duration,
}

impl WorkerServiceBuilder {
    pub fn new(
        worker_id: impl Into<String>,
        subscription: Arc<dyn MessageSubscription>,
        job_repository: Arc<dyn JobRepository>,
        model_client: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            subscription,
            job_repository,
            model_client,
            metrics: None,
            flow: FlowControl::default(),
            model_overrides: HashMap::new(),
            drain_timeout: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// 按应用配置设置流控、关闭超时和模型覆盖
    pub fn configure(self, config: &AppConfig) -> Self {
        self.flow_control(FlowControl::from_config(&config.message_queue, &config.worker))
            .model_overrides(config.model.model_overrides.clone())
            .shutdown_timeouts(
                Duration::from_secs(config.worker.drain_timeout_seconds),
                Duration::from_secs(config.worker.abort_grace_seconds),
            )
            .reconnect_delay(Duration::from_secs(config.message_queue.reconnect_delay_seconds))
    }

    pub fn metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn flow_control(mut self, flow: FlowControl) -> Self {
        self.flow = flow;
        self
    }

    pub fn model_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.model_overrides = overrides;
        self
    }

    pub fn shutdown_timeouts(mut self, drain_timeout: Duration, abort_grace: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self.abort_grace = abort_grace;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn build(self) -> WorkerService {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(WorkerMetrics::new(500, 100)));
        let activity = Arc::new(WorkerActivity::new(
            self.worker_id,
            self.subscription.subscription_name(),
            self.flow.max_messages,
        ));

        let processor = TextAnalysisProcessor::new(
            JobStateTracker::new(self.job_repository),
            self.model_client,
            Arc::clone(&metrics),
        )
        .with_model_overrides(self.model_overrides);
        let dispatcher = Arc::new(MessageDispatcher::new(
            processor,
            Arc::clone(&activity),
            Arc::clone(&metrics),
        ));
        let gate = Arc::new(FlowGate::new(self.flow));
        let consumer = QueueConsumer::new(
            self.subscription,
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
            Arc::clone(&gate),
        )
        .with_shutdown_timeouts(self.drain_timeout, self.abort_grace)
        .with_reconnect_delay(self.reconnect_delay);

        WorkerService {
            consumer,
            dispatcher,
            gate,
            activity,
            metrics,
        }
    }
}

/// 组装好的 worker：拉取循环、分发器和共享的活动/指标状态
pub struct WorkerService {
    consumer: QueueConsumer,
    dispatcher: Arc<MessageDispatcher>,
    gate: Arc<FlowGate>,
    activity: Arc<WorkerActivity>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerService {
    pub fn builder(
        worker_id: impl Into<String>,
        subscription: Arc<dyn MessageSubscription>,
        job_repository: Arc<dyn JobRepository>,
        model_client: Arc<dyn ModelClient>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(worker_id, subscription, job_repository, model_client)
    }

    /// 运行到收到关闭信号或订阅关闭为止
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> ScreeningResult<()> {
        info!(worker_id = self.activity.worker_id(), "Worker服务启动");
        let result = self.consumer.run(shutdown).await;
        let status = self.activity.status();
        info!(
            worker_id = %status.worker_id,
            processed = status.processed_jobs,
            failed = status.failed_jobs,
            "Worker服务已停止"
        );
        result
    }

    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// 推送入口与拉取循环共用的流控闸门
    pub fn flow_gate(&self) -> Arc<FlowGate> {
        Arc::clone(&self.gate)
    }

    pub fn activity(&self) -> Arc<WorkerActivity> {
        Arc::clone(&self.activity)
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        self.consumer.abort_handle()
    }
}
