use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use screening_domain::{Delivery, JobMessage, JobType, TransitionOutcome};
use screening_errors::ScreeningError;
use screening_observability::WorkerMetrics;

use crate::abort::AbortSignal;
use crate::activity::WorkerActivity;
use crate::pipeline::{panic_message, PipelineOutcome, TextAnalysisProcessor};

/// 消息的最终处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// 只有没有写入任何终态时才重新投递
    Nack,
}

/// 解码、按任务类型路由、校验并驱动处理流程
///
/// 任务内容上的错误全部落到终态后确认，只有存储不可用或关闭中止才会重新投递。
pub struct MessageDispatcher {
    processor: TextAnalysisProcessor,
    activity: Arc<WorkerActivity>,
    metrics: Arc<WorkerMetrics>,
}

impl MessageDispatcher {
    pub fn new(
        processor: TextAnalysisProcessor,
        activity: Arc<WorkerActivity>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            processor,
            activity,
            metrics,
        }
    }

    pub fn activity(&self) -> &Arc<WorkerActivity> {
        &self.activity
    }

    /// 处理一条消息并给出确认方式，处理流程之外的 panic 也会被兜住
    pub async fn handle(&self, delivery: &Delivery, abort: &AbortSignal) -> AckDecision {
        match AssertUnwindSafe(self.route(delivery, abort))
            .catch_unwind()
            .await
        {
            Ok(decision) => decision,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(delivery_id = %delivery.delivery_id, panic = %message, "分发消息时发生 panic");
                self.settle_after_panic(delivery, &message).await
            }
        }
    }

    #[instrument(skip_all, fields(delivery_id = %delivery.delivery_id, attempt = delivery.attempt))]
    async fn route(&self, delivery: &Delivery, abort: &AbortSignal) -> AckDecision {
        let message = match JobMessage::decode(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, size = delivery.size(), "消息无法解析，确认后丢弃");
                self.metrics.record_message_ignored("undecodable");
                return AckDecision::Ack;
            }
        };

        let job_type = message.job_type();
        if job_type != JobType::TextAnalysis {
            info!(
                job_type = job_type.as_str(),
                job_id = message.job_id().unwrap_or_default(),
                "非 text_analysis 任务，确认后忽略"
            );
            self.metrics.record_message_ignored("unsupported_job_type");
            return AckDecision::Ack;
        }

        let job = match message.validate() {
            Ok(job) => job,
            Err(err) => return self.reject(&message, err).await,
        };

        let _guard = self.activity.track(&delivery.delivery_id, &job.job_id);
        match self.processor.process(&job, abort).await {
            Ok(PipelineOutcome::Completed { .. }) => {
                self.activity.record_processed();
                AckDecision::Ack
            }
            Ok(PipelineOutcome::Failed { .. }) => {
                self.activity.record_processed();
                self.activity.record_failed();
                AckDecision::Ack
            }
            Ok(PipelineOutcome::Skipped { .. }) | Ok(PipelineOutcome::Orphaned) => {
                AckDecision::Ack
            }
            Ok(PipelineOutcome::Abandoned) => {
                self.metrics.record_redelivery_requested();
                AckDecision::Nack
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "任务存储不可用，消息将重新投递");
                self.metrics.record_redelivery_requested();
                AckDecision::Nack
            }
        }
    }

    /// 校验失败：有 job_id 时把任务写为 failed，然后确认
    async fn reject(&self, message: &JobMessage, err: ScreeningError) -> AckDecision {
        let Some(job_id) = message.job_id() else {
            warn!(error = %err, "无效消息且缺少 job_id，确认后丢弃");
            self.metrics.record_message_ignored("invalid_without_job_id");
            return AckDecision::Ack;
        };

        warn!(job_id, error = %err, "任务消息校验失败");
        let error_message = err.job_error_message();
        match self.processor.tracker().fail(job_id, &error_message).await {
            Ok(TransitionOutcome::Applied) => {
                self.metrics.record_job_failure(
                    job_id,
                    message.analysis_type.as_deref().unwrap_or("unknown"),
                    None,
                    err.kind(),
                    &error_message,
                    Duration::ZERO,
                );
                self.activity.record_processed();
                self.activity.record_failed();
                AckDecision::Ack
            }
            Ok(_) => AckDecision::Ack,
            Err(store_err) => {
                error!(job_id, error = %store_err, "写入校验失败状态时存储不可用，消息将重新投递");
                self.metrics.record_redelivery_requested();
                AckDecision::Nack
            }
        }
    }

    /// panic 后尽量把任务写为 failed；写入也失败时才重新投递
    async fn settle_after_panic(&self, delivery: &Delivery, panic: &str) -> AckDecision {
        let message = JobMessage::decode(&delivery.data).ok();
        let Some(job_id) = message.as_ref().and_then(JobMessage::job_id) else {
            warn!(delivery_id = %delivery.delivery_id, "panic 的消息没有 job_id，确认后丢弃");
            self.metrics.record_message_ignored("panic_without_job_id");
            return AckDecision::Ack;
        };

        let err = ScreeningError::Internal(format!("处理任务时发生异常: {panic}"));
        let error_message = err.job_error_message();
        let attempt = AssertUnwindSafe(self.processor.tracker().fail(job_id, &error_message))
            .catch_unwind()
            .await;
        match attempt {
            Ok(Ok(TransitionOutcome::Applied)) => {
                self.metrics.record_job_failure(
                    job_id,
                    message
                        .as_ref()
                        .and_then(|m| m.analysis_type.as_deref())
                        .unwrap_or("unknown"),
                    None,
                    err.kind(),
                    &error_message,
                    Duration::ZERO,
                );
                self.activity.record_processed();
                self.activity.record_failed();
                AckDecision::Ack
            }
            Ok(Ok(_)) => AckDecision::Ack,
            Ok(Err(store_err)) => {
                error!(job_id, error = %store_err, "panic 后写入失败状态时存储不可用，消息将重新投递");
                self.metrics.record_redelivery_requested();
                AckDecision::Nack
            }
            Err(_) => {
                error!(job_id, "panic 后写入失败状态时再次 panic，消息将重新投递");
                self.metrics.record_redelivery_requested();
                AckDecision::Nack
            }
        }
    }
}
