//! 单个 text_analysis 任务的处理流程
//!
//! submitted -> processing -> completed | failed。模型错误和处理中的 panic 都会落到
//! failed，只有存储层错误向上返回，由调用方决定是否重新投递。

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use screening_domain::{AnalysisResult, FindingStatus, JobStatus, TransitionOutcome, ValidatedJob};
use screening_errors::{ModelCallError, ScreeningError, ScreeningResult};
use screening_observability::WorkerMetrics;

use crate::abort::AbortSignal;
use crate::formatter::ResultFormatter;
use crate::model_client::{AnalysisRequest, ModelClient};
use crate::tracker::JobStateTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { findings: FindingStatus },
    Failed { kind: &'static str },
    /// 任务已处于终态，未做任何修改
    Skipped { current: JobStatus },
    /// 存储中没有该任务
    Orphaned,
    /// 因关闭而中止，任务保持 processing
    Abandoned,
}

pub struct TextAnalysisProcessor {
    tracker: JobStateTracker,
    model_client: Arc<dyn ModelClient>,
    formatter: ResultFormatter,
    metrics: Arc<WorkerMetrics>,
    model_overrides: HashMap<String, String>,
}

impl TextAnalysisProcessor {
    pub fn new(
        tracker: JobStateTracker,
        model_client: Arc<dyn ModelClient>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            tracker,
            model_client,
            formatter: ResultFormatter::new(),
            metrics,
            model_overrides: HashMap::new(),
        }
    }

    /// 按分析类型覆盖模型名称
    pub fn with_model_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.model_overrides = overrides;
        self
    }

    pub fn tracker(&self) -> &JobStateTracker {
        &self.tracker
    }

    #[instrument(skip_all, fields(job_id = %job.job_id, analysis_type = %job.analysis_type))]
    pub async fn process(
        &self,
        job: &ValidatedJob,
        abort: &AbortSignal,
    ) -> ScreeningResult<PipelineOutcome> {
        let started = Instant::now();

        match self.tracker.load(&job.job_id).await? {
            None => {
                warn!("任务记录不存在，跳过模型调用");
                return Ok(PipelineOutcome::Orphaned);
            }
            Some(existing) if existing.is_terminal() => {
                info!(current = %existing.status, "任务已处于终态，重复投递直接确认");
                return Ok(PipelineOutcome::Skipped {
                    current: existing.status,
                });
            }
            Some(_) => {}
        }

        match self.tracker.begin(&job.job_id).await? {
            TransitionOutcome::Applied => {}
            TransitionOutcome::Skipped { current } => {
                return Ok(PipelineOutcome::Skipped { current })
            }
            TransitionOutcome::NotFound => return Ok(PipelineOutcome::Orphaned),
        }

        let model = job.resolve_model(
            self.model_overrides
                .get(job.analysis_type.as_str())
                .map(String::as_str),
        );
        self.metrics.record_job_start(job.analysis_type.as_str());
        info!(model = %model, subject = %job.subject_name, "开始分析任务");

        let run = AssertUnwindSafe(self.analyze(job, &model, abort, started))
            .catch_unwind()
            .await;

        match run {
            Ok(Ok(result)) => self.record_success(job, &model, &result, started).await,
            Ok(Err(ModelCallError::Cancelled)) => {
                warn!("处理被中止，任务保持 processing 等待重新投递");
                Ok(PipelineOutcome::Abandoned)
            }
            Ok(Err(e)) => {
                warn!(error = %e, root_cause = %e.root_cause(), "模型调用失败");
                self.record_failure(job, &model, ScreeningError::from(e), started.elapsed())
                    .await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "处理任务时发生 panic");
                self.record_failure(
                    job,
                    &model,
                    ScreeningError::Internal(format!("处理任务时发生异常: {message}")),
                    started.elapsed(),
                )
                .await
            }
        }
    }

    async fn analyze(
        &self,
        job: &ValidatedJob,
        model: &str,
        abort: &AbortSignal,
        started: Instant,
    ) -> Result<AnalysisResult, ModelCallError> {
        let request = AnalysisRequest {
            job_id: job.job_id.clone(),
            model: model.to_string(),
            subject_name: job.subject_name.clone(),
            analysis_type: job.analysis_type,
            entity_type: job.entity_type,
            prompt: job.user_prompt(),
        };
        let response = self.model_client.call(&request, abort).await?;
        Ok(self
            .formatter
            .format(job, model, &response, started.elapsed()))
    }

    async fn record_success(
        &self,
        job: &ValidatedJob,
        model: &str,
        result: &AnalysisResult,
        started: Instant,
    ) -> ScreeningResult<PipelineOutcome> {
        match self.tracker.complete(&job.job_id, result).await? {
            TransitionOutcome::Applied => {
                self.metrics
                    .record_job_success(job.analysis_type.as_str(), model, started.elapsed());
                Ok(PipelineOutcome::Completed {
                    findings: result.findings.status,
                })
            }
            TransitionOutcome::Skipped { current } => Ok(PipelineOutcome::Skipped { current }),
            TransitionOutcome::NotFound => Ok(PipelineOutcome::Orphaned),
        }
    }

    async fn record_failure(
        &self,
        job: &ValidatedJob,
        model: &str,
        err: ScreeningError,
        elapsed: Duration,
    ) -> ScreeningResult<PipelineOutcome> {
        let message = err.job_error_message();
        match self.tracker.fail(&job.job_id, &message).await? {
            TransitionOutcome::Applied => {
                self.metrics.record_job_failure(
                    &job.job_id,
                    job.analysis_type.as_str(),
                    Some(model),
                    err.kind(),
                    &message,
                    elapsed,
                );
                Ok(PipelineOutcome::Failed { kind: err.kind() })
            }
            TransitionOutcome::Skipped { current } => Ok(PipelineOutcome::Skipped { current }),
            TransitionOutcome::NotFound => Ok(PipelineOutcome::Orphaned),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
