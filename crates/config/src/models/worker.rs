use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_concurrent_jobs: usize,
    /// 关闭时等待在途任务完成的时间
    pub drain_timeout_seconds: u64,
    /// 发出中止信号后等待任务收尾的时间
    pub abort_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "text-analysis-worker-001".to_string(),
            max_concurrent_jobs: 16,
            drain_timeout_seconds: 30,
            abort_grace_seconds: 5,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_id, "worker.worker_id")?;
        ValidationUtils::validate_count(self.max_concurrent_jobs, "worker.max_concurrent_jobs", 1000)?;
        ValidationUtils::validate_timeout(self.drain_timeout_seconds, "worker.drain_timeout_seconds")?;
        ValidationUtils::validate_timeout(self.abort_grace_seconds, "worker.abort_grace_seconds")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.worker_id = "".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.max_concurrent_jobs = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config;
        invalid.drain_timeout_seconds = 0;
        assert!(invalid.validate().is_err());
    }
}
