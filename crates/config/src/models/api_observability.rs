use serde::{Deserialize, Serialize};

use super::logging::{LogFormat, LogLevel};
use crate::validation::{ConfigValidator, ValidationUtils};

/// 健康检查与推送入口的HTTP服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// 是否开放 POST /process 推送入口
    pub push_endpoint_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            push_endpoint_enabled: false,
        }
    }
}

impl ConfigValidator for ApiConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        ValidationUtils::validate_not_empty(&self.bind_address, "api.bind_address")?;
        self.bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                crate::ConfigError::Validation(format!(
                    "api.bind_address must be a socket address: {e}"
                ))
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    /// 内存中保留的处理耗时样本数
    pub max_timing_samples: usize,
    /// 内存中保留的最近错误数
    pub max_error_samples: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            metrics_enabled: true,
            max_timing_samples: 500,
            max_error_samples: 100,
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(
            self.max_timing_samples,
            "observability.max_timing_samples",
            100_000,
        )?;
        ValidationUtils::validate_count(
            self.max_error_samples,
            "observability.max_error_samples",
            10_000,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_validation() {
        assert!(ApiConfig::default().validate().is_ok());

        let invalid = ApiConfig {
            bind_address: "localhost".to_string(),
            ..ApiConfig::default()
        };
        assert!(invalid.validate().is_err());

        let disabled = ApiConfig {
            enabled: false,
            bind_address: String::new(),
            ..ApiConfig::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_observability_config_validation() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.max_timing_samples, 500);
        assert_eq!(config.max_error_samples, 100);
        assert!(config.validate().is_ok());

        let invalid = ObservabilityConfig {
            max_error_samples: 0,
            ..config
        };
        assert!(invalid.validate().is_err());
    }
}
