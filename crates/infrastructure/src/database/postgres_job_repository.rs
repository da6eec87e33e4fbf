use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Row};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use screening_domain::{AnalysisResult, Job, JobRepository, JobStatus, TransitionOutcome};
use screening_errors::{ScreeningError, ScreeningResult};

const JOB_COLUMNS: &str = "job_id, job_type, analysis_type, entity_type, subject_name, model_name, \
     status, result, error, created_at, updated_at, completed_at";

/// PostgreSQL 任务仓储
///
/// 终态写入带 `status IN ('submitted','processing')` 条件，
/// 多个 worker 并发处理同一任务时只有第一个终态写入生效。
pub struct PostgresJobRepository {
    pool: PgPool,
    write_timeout: Duration,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool, write_timeout: Duration) -> Self {
        Self {
            pool,
            write_timeout,
        }
    }

    pub async fn ensure_schema(&self) -> ScreeningResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id VARCHAR(255) PRIMARY KEY,
                job_type VARCHAR(64) NOT NULL,
                analysis_type VARCHAR(64) NOT NULL,
                entity_type VARCHAR(32) NOT NULL,
                subject_name TEXT NOT NULL,
                model_name VARCHAR(255),
                status VARCHAR(32) NOT NULL,
                result JSONB,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> ScreeningResult<Job> {
        let result: Option<Json<AnalysisResult>> = row.try_get("result")?;
        Ok(Job {
            job_id: row.try_get("job_id")?,
            job_type: row.try_get("job_type")?,
            analysis_type: row.try_get("analysis_type")?,
            entity_type: row.try_get("entity_type")?,
            subject_name: row.try_get("subject_name")?,
            model_name: row.try_get("model_name")?,
            status: row.try_get("status")?,
            result: result.map(|json| json.0),
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> ScreeningResult<T>
    where
        F: Future<Output = ScreeningResult<T>>,
    {
        tokio::time::timeout(self.write_timeout, fut)
            .await
            .map_err(|_| {
                ScreeningError::Timeout(format!(
                    "{operation} 超过 {}s 未完成",
                    self.write_timeout.as_secs()
                ))
            })?
    }

    async fn current_status(&self, job_id: &str) -> ScreeningResult<Option<JobStatus>> {
        let row = self
            .with_timeout("查询任务状态", async {
                sqlx::query("SELECT status FROM jobs WHERE job_id = $1")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(ScreeningError::Database)
            })
            .await?;
        row.map(|row| row.try_get::<JobStatus, _>("status"))
            .transpose()
            .map_err(ScreeningError::Database)
    }

    /// 根据受影响行数判断条件写入是否生效
    async fn outcome(&self, job_id: &str, rows_affected: u64) -> ScreeningResult<TransitionOutcome> {
        if rows_affected > 0 {
            return Ok(TransitionOutcome::Applied);
        }
        match self.current_status(job_id).await? {
            Some(current) => {
                debug!(job_id, current = %current, "任务已处于终态，跳过写入");
                Ok(TransitionOutcome::Skipped { current })
            }
            None => {
                warn!(job_id, "任务记录不存在");
                Ok(TransitionOutcome::NotFound)
            }
        }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, status = %job.status))]
    async fn create(&self, job: &Job) -> ScreeningResult<Job> {
        let query = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .with_timeout("创建任务", async {
                sqlx::query(&query)
                    .bind(&job.job_id)
                    .bind(&job.job_type)
                    .bind(&job.analysis_type)
                    .bind(&job.entity_type)
                    .bind(&job.subject_name)
                    .bind(&job.model_name)
                    .bind(job.status)
                    .bind(job.result.as_ref().map(Json))
                    .bind(&job.error)
                    .bind(job.created_at)
                    .bind(job.updated_at)
                    .bind(job.completed_at)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(ScreeningError::Database)
            })
            .await?;

        let created = Self::row_to_job(&row)?;
        debug!("创建任务成功: {}", created.entity_description());
        Ok(created)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn get(&self, job_id: &str) -> ScreeningResult<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = self
            .with_timeout("查询任务", async {
                sqlx::query(&query)
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(ScreeningError::Database)
            })
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn mark_processing(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        let result = self
            .with_timeout("标记处理中", async {
                sqlx::query(
                    "UPDATE jobs SET status = $2, updated_at = $3 \
                     WHERE job_id = $1 AND status IN ('submitted', 'processing')",
                )
                .bind(job_id)
                .bind(JobStatus::Processing)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(ScreeningError::Database)
            })
            .await?;

        self.outcome(job_id, result.rows_affected()).await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id, findings = %result.findings.status))]
    async fn mark_completed(
        &self,
        job_id: &str,
        result: &AnalysisResult,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        let done = self
            .with_timeout("写入完成状态", async {
                sqlx::query(
                    "UPDATE jobs SET status = $2, result = $3, error = NULL, updated_at = $4, \
                     completed_at = COALESCE(completed_at, $4) \
                     WHERE job_id = $1 AND status IN ('submitted', 'processing')",
                )
                .bind(job_id)
                .bind(JobStatus::Completed)
                .bind(Json(result))
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(ScreeningError::Database)
            })
            .await?;

        self.outcome(job_id, done.rows_affected()).await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id))]
    async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> ScreeningResult<TransitionOutcome> {
        let done = self
            .with_timeout("写入失败状态", async {
                sqlx::query(
                    "UPDATE jobs SET status = $2, result = NULL, error = $3, updated_at = $4, \
                     completed_at = COALESCE(completed_at, $4) \
                     WHERE job_id = $1 AND status IN ('submitted', 'processing')",
                )
                .bind(job_id)
                .bind(JobStatus::Failed)
                .bind(error)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(ScreeningError::Database)
            })
            .await?;

        self.outcome(job_id, done.rows_affected()).await
    }
}
