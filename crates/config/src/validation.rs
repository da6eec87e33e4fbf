// 配置验证
// 各配置段实现 ConfigValidator，公共检查集中在 ValidationUtils

use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

pub struct ValidationUtils;

impl ValidationUtils {
    /// 验证字符串非空
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// 验证超时值
    pub fn validate_timeout(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 3600 seconds"
            )));
        }
        Ok(())
    }

    /// 验证URL格式
    pub fn validate_url(value: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(value, field_name)?;
        url::Url::parse(value).map_err(|e| {
            ConfigError::Validation(format!("{field_name} must be a valid URL: {e}"))
        })?;
        Ok(())
    }

    /// 验证URL协议
    pub fn validate_url_scheme(value: &str, field_name: &str, schemes: &[&str]) -> ConfigResult<()> {
        Self::validate_url(value, field_name)?;
        let url = url::Url::parse(value)?;
        if !schemes.contains(&url.scheme()) {
            return Err(ConfigError::Validation(format!(
                "{field_name} must use one of the schemes {schemes:?}"
            )));
        }
        Ok(())
    }

    /// 验证计数值
    pub fn validate_count(count: usize, field_name: &str, max_value: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max_value {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max_value}"
            )));
        }
        Ok(())
    }
}
