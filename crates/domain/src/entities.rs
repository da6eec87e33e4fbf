use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 任务记录，按 `job_id` 存储
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub analysis_type: String,
    pub entity_type: String,
    pub subject_name: String,
    pub model_name: Option<String>,
    pub status: JobStatus,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        analysis_type: AnalysisType,
        entity_type: EntityType,
        subject_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            job_type: JobType::TEXT_ANALYSIS.to_string(),
            analysis_type: analysis_type.as_str().to_string(),
            entity_type: entity_type.as_str().to_string(),
            subject_name: subject_name.into(),
            model_name: Some(analysis_type.default_model_name().to_string()),
            status: JobStatus::Submitted,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 终态任务必须且只能带有 result/error 之一
    pub fn has_consistent_outcome(&self) -> bool {
        match self.status {
            JobStatus::Completed => self.result.is_some() && self.error.is_none(),
            JobStatus::Failed => self.error.is_some() && self.result.is_none(),
            JobStatus::Submitted | JobStatus::Processing => {
                self.result.is_none() && self.error.is_none()
            }
        }
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (分析类型: {}, 主体类型: {})",
            self.job_id, self.analysis_type, self.entity_type
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// 状态单调前进；processing 可重入以支持重投递后的重新处理
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Submitted, JobStatus::Submitted) => false,
            (JobStatus::Submitted, _) => true,
            (JobStatus::Processing, JobStatus::Submitted) => false,
            (JobStatus::Processing, _) => true,
            (JobStatus::Completed | JobStatus::Failed, _) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(JobStatus::Submitted),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse::<JobStatus>().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 消息中的任务类型，只有 text_analysis 由本服务处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobType {
    TextAnalysis,
    Document,
    Other(String),
}

impl JobType {
    pub const TEXT_ANALYSIS: &'static str = "text_analysis";

    pub fn parse(value: &str) -> Self {
        match value {
            Self::TEXT_ANALYSIS => JobType::TextAnalysis,
            "document" => JobType::Document,
            other => JobType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::TextAnalysis => Self::TEXT_ANALYSIS,
            JobType::Document => "document",
            JobType::Other(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Corporate,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Corporate => "corporate",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person" => Ok(EntityType::Person),
            "corporate" => Ok(EntityType::Corporate),
            _ => Err(format!("未知的主体类型: {s}")),
        }
    }
}

/// 分析目录：决定默认模型与允许的主体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisType {
    PepAnalysis,
    NegativeNews,
    LawInvolvement,
    CorporateNegativeNews,
    CorporateLawInvolvement,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 5] = [
        AnalysisType::PepAnalysis,
        AnalysisType::NegativeNews,
        AnalysisType::LawInvolvement,
        AnalysisType::CorporateNegativeNews,
        AnalysisType::CorporateLawInvolvement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::PepAnalysis => "pep-analysis",
            AnalysisType::NegativeNews => "negative-news",
            AnalysisType::LawInvolvement => "law-involvement",
            AnalysisType::CorporateNegativeNews => "corporate-negative-news",
            AnalysisType::CorporateLawInvolvement => "corporate-law-involvement",
        }
    }

    pub fn default_model_name(&self) -> &'static str {
        match self {
            AnalysisType::PepAnalysis => "politically-exposed-person-v2",
            AnalysisType::NegativeNews => "negative-news",
            AnalysisType::LawInvolvement => "law-involvement",
            AnalysisType::CorporateNegativeNews => "negative-news-corporate",
            AnalysisType::CorporateLawInvolvement => "law-involvement-corporate",
        }
    }

    pub fn allowed_entity_type(&self) -> EntityType {
        match self {
            AnalysisType::PepAnalysis
            | AnalysisType::NegativeNews
            | AnalysisType::LawInvolvement => EntityType::Person,
            AnalysisType::CorporateNegativeNews | AnalysisType::CorporateLawInvolvement => {
                EntityType::Corporate
            }
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("未知的分析类型: {s}"))
    }
}

/// 模型调用的令牌用量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
}

/// 持久化的分析结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub analysis_type: String,
    pub entity_type: String,
    pub entity_name: String,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    pub findings: Findings,
    pub metadata: ResultMetadata,
    pub raw_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Findings {
    pub status: FindingStatus,
    pub summary: String,
    pub details: Vec<FindingDetail>,
    pub sources: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl Findings {
    /// 加入来源，保持首次出现的顺序并去重
    pub fn add_source(&mut self, source: impl Into<String>) {
        let source = source.into();
        let source = source.trim();
        if !source.is_empty() && !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FindingDetail {
    #[serde(rename = "type")]
    pub detail_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub processing_time_seconds: f64,
    pub model_version: String,
    pub analysis_timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Positive,
    Negative,
    Neutral,
    Unknown,
}

impl FindingStatus {
    const POSITIVE: [&'static str; 3] = ["positive", "yes", "found"];
    const NEGATIVE: [&'static str; 3] = ["negative", "no", "clean"];
    const NEUTRAL: [&'static str; 2] = ["neutral", "unclear"];

    /// 对模型自报结论做按词分类，依次匹配 positive、negative、neutral
    pub fn classify(verdict: &str) -> Self {
        let lowered = verdict.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let matches = |set: &[&str]| tokens.iter().any(|t| set.contains(t));

        if matches(&Self::POSITIVE) {
            FindingStatus::Positive
        } else if matches(&Self::NEGATIVE) {
            FindingStatus::Negative
        } else if matches(&Self::NEUTRAL) {
            FindingStatus::Neutral
        } else {
            FindingStatus::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Positive => "positive",
            FindingStatus::Negative => "negative",
            FindingStatus::Neutral => "neutral",
            FindingStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
