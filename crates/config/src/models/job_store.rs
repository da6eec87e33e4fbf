use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStoreType {
    Postgres,
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreConfig {
    pub r#type: JobStoreType,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    /// 单次状态写入的超时
    pub write_timeout_seconds: u64,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            r#type: JobStoreType::Postgres,
            url: "postgresql://localhost/screening".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            write_timeout_seconds: 10,
        }
    }
}

impl ConfigValidator for JobStoreConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.r#type == JobStoreType::Postgres {
            ValidationUtils::validate_url_scheme(
                &self.url,
                "job_store.url",
                &["postgres", "postgresql"],
            )?;
            if self.max_connections == 0 {
                return Err(crate::ConfigError::Validation(
                    "job_store.max_connections must be greater than 0".to_string(),
                ));
            }
            if self.min_connections > self.max_connections {
                return Err(crate::ConfigError::Validation(
                    "job_store.min_connections cannot exceed job_store.max_connections".to_string(),
                ));
            }
        }
        ValidationUtils::validate_timeout(
            self.connection_timeout_seconds,
            "job_store.connection_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout(self.write_timeout_seconds, "job_store.write_timeout_seconds")?;
        Ok(())
    }
}
