use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use screening_domain::{AnalysisResult, Job, JobRepository, JobStatus, TransitionOutcome};
use screening_errors::{ScreeningError, ScreeningResult};

/// 内存任务仓储，与 PostgreSQL 实现遵循相同的条件写入规则
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        job_id: &str,
        next: JobStatus,
        apply: F,
    ) -> ScreeningResult<TransitionOutcome>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !job.status.can_transition_to(next) {
            debug!(job_id, current = %job.status, next = %next, "跳过不允许的状态迁移");
            return Ok(TransitionOutcome::Skipped {
                current: job.status,
            });
        }
        job.status = next;
        apply(job);
        Ok(TransitionOutcome::Applied)
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> ScreeningResult<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(ScreeningError::job_store(format!(
                "任务 {} 已存在",
                job.job_id
            )));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(job.clone())
    }

    async fn get(&self, job_id: &str) -> ScreeningResult<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn mark_processing(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        self.transition(job_id, JobStatus::Processing, |job| {
            job.updated_at = at;
        })
        .await
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        result: &AnalysisResult,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        self.transition(job_id, JobStatus::Completed, |job| {
            job.result = Some(result.clone());
            job.error = None;
            job.updated_at = at;
            job.completed_at.get_or_insert(at);
        })
        .await
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.result = None;
            job.error = Some(error.to_string());
            job.updated_at = at;
            job.completed_at.get_or_insert(at);
        })
        .await
    }
}
