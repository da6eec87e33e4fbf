use std::collections::HashMap;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 外部推理模型的调用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub chat_path: String,
    pub api_key: String,
    /// 单次调用超时
    pub timeout_seconds: u64,
    /// 首次调用之后的最大重试次数
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_seconds: u64,
    /// 模型推理令牌的硬上限，空内容且达到该值视为推理耗尽
    pub reasoning_token_limit: u64,
    pub tool_ids: Vec<String>,
    /// analysis_type -> 模型名 的覆盖
    pub model_overrides: HashMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            chat_path: "/api/chat/completions".to_string(),
            api_key: String::new(),
            timeout_seconds: 300,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_seconds: 60,
            reasoning_token_limit: 2000,
            tool_ids: vec!["web_search".to_string()],
            model_overrides: HashMap::new(),
        }
    }
}

impl ModelConfig {
    pub fn chat_endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.chat_path.trim_start_matches('/')
        )
    }
}

impl ConfigValidator for ModelConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_url_scheme(&self.base_url, "model.base_url", &["http", "https"])?;
        ValidationUtils::validate_not_empty(&self.chat_path, "model.chat_path")?;
        ValidationUtils::validate_not_empty(&self.api_key, "model.api_key")?;
        ValidationUtils::validate_timeout(self.timeout_seconds, "model.timeout_seconds")?;
        ValidationUtils::validate_timeout(self.max_delay_seconds, "model.max_delay_seconds")?;

        if self.max_retries > 10 {
            return Err(crate::ConfigError::Validation(
                "model.max_retries must be less than or equal to 10".to_string(),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "model.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_seconds * 1000 {
            return Err(crate::ConfigError::Validation(
                "model.base_delay_ms cannot exceed model.max_delay_seconds".to_string(),
            ));
        }
        if self.reasoning_token_limit == 0 {
            return Err(crate::ConfigError::Validation(
                "model.reasoning_token_limit must be greater than 0".to_string(),
            ));
        }
        for (analysis_type, model) in &self.model_overrides {
            ValidationUtils::validate_not_empty(analysis_type, "model.model_overrides key")?;
            ValidationUtils::validate_not_empty(model, "model.model_overrides value")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ModelConfig {
        ModelConfig {
            api_key: "sk-test".to_string(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_model_config_defaults() {
        let config = valid();
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_delay_seconds, 60);
        assert_eq!(config.reasoning_token_limit, 2000);
        assert_eq!(config.tool_ids, vec!["web_search".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_rejected() {
        assert!(ModelConfig::default().validate().is_err());
    }

    #[test]
    fn test_chat_endpoint_joins_slashes() {
        let mut config = valid();
        config.base_url = "https://models.internal/".to_string();
        assert_eq!(
            config.chat_endpoint(),
            "https://models.internal/api/chat/completions"
        );
    }

    #[test]
    fn test_delay_bounds() {
        let mut config = valid();
        config.base_delay_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.max_retries = 11;
        assert!(config.validate().is_err());
    }
}
