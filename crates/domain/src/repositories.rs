//! 任务仓储抽象
//!
//! 终态写入以当前状态为条件（比较并交换），重复投递不会覆盖已有结果

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{AnalysisResult, Job, JobStatus};
use screening_errors::ScreeningResult;

/// 条件写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// 当前状态不允许该迁移，未做任何修改
    Skipped { current: JobStatus },
    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied)
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> ScreeningResult<Job>;
    async fn get(&self, job_id: &str) -> ScreeningResult<Option<Job>>;
    /// submitted/processing -> processing
    async fn mark_processing(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome>;
    /// 仅当尚未到达终态时写入 completed
    async fn mark_completed(
        &self,
        job_id: &str,
        result: &AnalysisResult,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome>;
    /// 仅当尚未到达终态时写入 failed
    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome>;
}
