pub mod in_memory_job_repository;
pub mod postgres_job_repository;

pub use in_memory_job_repository::InMemoryJobRepository;
pub use postgres_job_repository::PostgresJobRepository;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use screening_config::{JobStoreConfig, JobStoreType};
use screening_domain::JobRepository;
use screening_errors::ScreeningResult;

pub struct JobRepositoryFactory;

impl JobRepositoryFactory {
    /// 按配置创建任务仓储，PostgreSQL 会先确保表结构存在
    pub async fn create(config: &JobStoreConfig) -> ScreeningResult<Arc<dyn JobRepository>> {
        match config.r#type {
            JobStoreType::Postgres => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
                    .connect(&config.url)
                    .await?;
                let repository = PostgresJobRepository::new(
                    pool,
                    Duration::from_secs(config.write_timeout_seconds),
                );
                repository.ensure_schema().await?;
                info!("PostgreSQL任务仓储已就绪");
                Ok(Arc::new(repository))
            }
            JobStoreType::InMemory => {
                info!("使用内存任务仓储");
                Ok(Arc::new(InMemoryJobRepository::new()))
            }
        }
    }
}
