use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use screening_domain::{AnalysisResult, Job, JobRepository, TransitionOutcome};
use screening_errors::ScreeningResult;

/// 任务记录生命周期的唯一写入方
///
/// 所有迁移都是条件写入，已到终态的任务不会被重复投递覆盖。
#[derive(Clone)]
pub struct JobStateTracker {
    repository: Arc<dyn JobRepository>,
}

impl JobStateTracker {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    pub async fn load(&self, job_id: &str) -> ScreeningResult<Option<Job>> {
        self.repository.get(job_id).await
    }

    pub async fn begin(&self, job_id: &str) -> ScreeningResult<TransitionOutcome> {
        let outcome = self.repository.mark_processing(job_id, Utc::now()).await?;
        log_outcome(job_id, "processing", &outcome);
        Ok(outcome)
    }

    pub async fn complete(
        &self,
        job_id: &str,
        result: &AnalysisResult,
    ) -> ScreeningResult<TransitionOutcome> {
        let outcome = self
            .repository
            .mark_completed(job_id, result, Utc::now())
            .await?;
        if outcome.is_applied() {
            info!(job_id, findings = %result.findings.status, "任务已完成");
        }
        log_outcome(job_id, "completed", &outcome);
        Ok(outcome)
    }

    pub async fn fail(&self, job_id: &str, error: &str) -> ScreeningResult<TransitionOutcome> {
        let outcome = self
            .repository
            .mark_failed(job_id, error, Utc::now())
            .await?;
        if outcome.is_applied() {
            warn!(job_id, error, "任务已标记为失败");
        }
        log_outcome(job_id, "failed", &outcome);
        Ok(outcome)
    }
}

fn log_outcome(job_id: &str, target: &str, outcome: &TransitionOutcome) {
    match outcome {
        TransitionOutcome::Applied => debug!(job_id, target, "状态写入成功"),
        TransitionOutcome::Skipped { current } => {
            info!(job_id, target, current = %current, "任务已处于终态，忽略本次写入")
        }
        TransitionOutcome::NotFound => warn!(job_id, target, "任务记录不存在，无法写入状态"),
    }
}
