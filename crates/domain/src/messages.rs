use serde::{Deserialize, Serialize};

use crate::entities::{AnalysisType, EntityType, JobType};
use screening_errors::{ScreeningError, ScreeningResult};

/// 队列中的任务消息，字段全部可缺省，校验在 [`JobMessage::validate`] 中完成
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

/// 通过校验的 text_analysis 任务
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub job_id: String,
    pub analysis_type: AnalysisType,
    pub entity_type: EntityType,
    pub subject_name: String,
    pub requested_model: Option<String>,
    pub additional_context: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl JobMessage {
    pub fn text_analysis(
        job_id: impl Into<String>,
        analysis_type: AnalysisType,
        entity_type: EntityType,
        subject_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: Some(job_id.into()),
            job_type: Some(JobType::TEXT_ANALYSIS.to_string()),
            analysis_type: Some(analysis_type.as_str().to_string()),
            entity_type: Some(entity_type.as_str().to_string()),
            subject_name: Some(subject_name.into()),
            ..Self::default()
        }
    }

    pub fn decode(data: &[u8]) -> ScreeningResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ScreeningError::Serialization(format!("无法解析任务消息: {e}")))
    }

    pub fn encode(&self) -> ScreeningResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 缺省时视为 text_analysis
    pub fn job_type(&self) -> JobType {
        non_empty(&self.job_type)
            .map(JobType::parse)
            .unwrap_or(JobType::TextAnalysis)
    }

    pub fn job_id(&self) -> Option<&str> {
        non_empty(&self.job_id)
    }

    pub fn validate(&self) -> ScreeningResult<ValidatedJob> {
        let fields = [
            ("job_id", non_empty(&self.job_id)),
            ("analysis_type", non_empty(&self.analysis_type)),
            ("entity_type", non_empty(&self.entity_type)),
            ("subject_name", non_empty(&self.subject_name)),
        ];
        let missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ScreeningError::validation_error(format!(
                "缺少必填字段: {}",
                missing.join(", ")
            )));
        }

        let [(_, Some(job_id)), (_, Some(analysis_type)), (_, Some(entity_type)), (_, Some(subject_name))] =
            fields
        else {
            return Err(ScreeningError::validation_error("缺少必填字段"));
        };

        let analysis_type: AnalysisType = analysis_type
            .parse()
            .map_err(ScreeningError::validation_error)?;
        let entity_type: EntityType = entity_type
            .parse()
            .map_err(ScreeningError::validation_error)?;
        if analysis_type.allowed_entity_type() != entity_type {
            return Err(ScreeningError::validation_error(format!(
                "分析类型 {analysis_type} 不支持主体类型 {entity_type}，应为 {}",
                analysis_type.allowed_entity_type()
            )));
        }

        Ok(ValidatedJob {
            job_id: job_id.to_string(),
            analysis_type,
            entity_type,
            subject_name: subject_name.to_string(),
            requested_model: non_empty(&self.model_name).map(str::to_string),
            additional_context: non_empty(&self.additional_context).map(str::to_string),
        })
    }
}

impl ValidatedJob {
    /// 模型选择顺序：配置覆盖、消息指定、目录默认
    pub fn resolve_model(&self, override_model: Option<&str>) -> String {
        override_model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or(self.requested_model.as_deref())
            .unwrap_or(self.analysis_type.default_model_name())
            .to_string()
    }

    pub fn user_prompt(&self) -> String {
        match &self.additional_context {
            Some(context) => format!("{}\n\nAdditional Context: {context}", self.subject_name),
            None => self.subject_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> JobMessage {
        JobMessage::decode(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let err = JobMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, ScreeningError::Serialization(_)));
    }

    #[test]
    fn test_job_type_defaults_to_text_analysis() {
        let message = decode(r#"{"job_id":"J1"}"#);
        assert_eq!(message.job_type(), JobType::TextAnalysis);

        let message = decode(r#"{"job_id":"J1","job_type":"document"}"#);
        assert_eq!(message.job_type(), JobType::Document);
    }

    #[test]
    fn test_name_alias_and_context() {
        let message = decode(
            r#"{"job_id":"J1","analysis_type":"pep-analysis","entity_type":"person",
                "name":"Jane Doe","additional_context":"Former minister","timestamp":1700000000}"#,
        );
        let job = message.validate().unwrap();
        assert_eq!(job.subject_name, "Jane Doe");
        assert_eq!(
            job.user_prompt(),
            "Jane Doe\n\nAdditional Context: Former minister"
        );
    }

    #[test]
    fn test_missing_fields_reported() {
        let message = decode(
            r#"{"job_id":"J2","job_type":"text_analysis","analysis_type":"negative-news","entity_type":"person"}"#,
        );
        let err = message.validate().unwrap_err();
        assert!(matches!(err, ScreeningError::Validation(_)));
        assert!(err.to_string().contains("subject_name"));
        assert_eq!(message.job_id(), Some("J2"));

        let message = decode(r#"{"subject_name":"  "}"#);
        let err = message.validate().unwrap_err().to_string();
        assert!(err.contains("job_id"));
        assert!(err.contains("subject_name"));
        assert_eq!(message.job_id(), None);
    }

    #[test]
    fn test_entity_type_mismatch_rejected() {
        let message = JobMessage::text_analysis(
            "J3",
            AnalysisType::CorporateLawInvolvement,
            EntityType::Person,
            "Acme Ltd",
        );
        assert!(matches!(
            message.validate(),
            Err(ScreeningError::Validation(_))
        ));

        let mut message = message;
        message.analysis_type = Some("horoscope".to_string());
        assert!(message.validate().is_err());
    }

    #[test]
    fn test_model_resolution_order() {
        let mut message =
            JobMessage::text_analysis("J4", AnalysisType::NegativeNews, EntityType::Person, "Jane");
        let job = message.validate().unwrap();
        assert_eq!(job.resolve_model(None), "negative-news");

        message.model_name = Some("negative-news-beta".to_string());
        let job = message.validate().unwrap();
        assert_eq!(job.resolve_model(None), "negative-news-beta");
        assert_eq!(job.resolve_model(Some("negative-news-v3")), "negative-news-v3");
        assert_eq!(job.resolve_model(Some(" ")), "negative-news-beta");
    }
}
