//! 把模型的自由格式输出整理成固定结构的分析结果

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

use screening_domain::{
    AnalysisResult, FindingDetail, FindingStatus, Findings, ResultMetadata, ValidatedJob,
};

use crate::model_client::ModelResponse;

const STATUS_KEYS: [&str; 3] = ["status", "result", "finding"];
const SUMMARY_KEYS: [&str; 3] = ["summary", "description", "overview"];
const DETAIL_KEYS: [&str; 4] = ["details", "findings", "items", "results"];
const SOURCE_KEYS: [&str; 3] = ["sources", "references", "links"];
const CONFIDENCE_KEYS: [&str; 3] = ["confidence", "confidence_score", "certainty"];

const DETAIL_TYPE_KEYS: [&str; 3] = ["type", "category", "kind"];
const DETAIL_TEXT_KEYS: [&str; 5] = ["description", "summary", "text", "title", "detail"];
const DETAIL_SOURCE_KEYS: [&str; 3] = ["source", "url", "link"];

const DEFAULT_SUMMARY: &str = "Analysis completed";
const UNSTRUCTURED_SUMMARY: &str = "Analysis completed; response was not structured JSON";

#[derive(Debug, Clone, Default)]
pub struct ResultFormatter;

impl ResultFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(
        &self,
        job: &ValidatedJob,
        model: &str,
        response: &ModelResponse,
        processing_time: Duration,
    ) -> AnalysisResult {
        let now = Utc::now();
        let parsed = extract_json_object(&response.content);

        let (mut findings, confidence_score) = match &parsed {
            Some(object) => (findings_from_object(object, now), confidence(object)),
            None => (
                Findings {
                    status: FindingStatus::Unknown,
                    summary: UNSTRUCTURED_SUMMARY.to_string(),
                    details: Vec::new(),
                    sources: Vec::new(),
                    last_updated: now,
                },
                None,
            ),
        };
        for source in &response.sources {
            findings.add_source(source.as_str());
        }

        AnalysisResult {
            analysis_type: job.analysis_type.as_str().to_string(),
            entity_type: job.entity_type.as_str().to_string(),
            entity_name: job.subject_name.clone(),
            model_used: model.to_string(),
            confidence_score,
            findings,
            metadata: ResultMetadata {
                processing_time_seconds: processing_time.as_secs_f64(),
                model_version: response.model.clone(),
                analysis_timestamp: now,
                attempts: response.attempts,
                usage: response.usage,
            },
            raw_response: response.content.clone(),
        }
    }
}

/// 依次尝试整段内容、围栏代码块、最外层花括号片段
fn extract_json_object(content: &str) -> Option<Map<String, Value>> {
    let trimmed = content.trim();
    let candidates = [
        Some(trimmed),
        fenced_block(trimmed),
        outer_braces(trimmed),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn fenced_block(content: &str) -> Option<&str> {
    let start = content.find("```")?;
    let after = &content[start + 3..];
    // 跳过语言标记所在的行
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outer_braces(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

fn findings_from_object(object: &Map<String, Value>, now: DateTime<Utc>) -> Findings {
    let status = STATUS_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .filter_map(verdict_text)
        .map(|text| FindingStatus::classify(&text))
        .find(|status| *status != FindingStatus::Unknown)
        .unwrap_or(FindingStatus::Unknown);

    let summary = SUMMARY_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUMMARY)
        .to_string();

    let details = DETAIL_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .flat_map(detail_entries)
        .collect();

    let mut findings = Findings {
        status,
        summary,
        details,
        sources: Vec::new(),
        last_updated: now,
    };
    for value in SOURCE_KEYS.iter().filter_map(|key| object.get(*key)) {
        match value {
            Value::Array(items) => items
                .iter()
                .filter_map(source_text)
                .for_each(|s| findings.add_source(s)),
            other => {
                if let Some(s) = source_text(other) {
                    findings.add_source(s);
                }
            }
        }
    }
    findings
}

fn verdict_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("yes".to_string()),
        Value::Bool(false) => Some("no".to_string()),
        _ => None,
    }
}

fn detail_entries(value: &Value) -> Vec<FindingDetail> {
    match value {
        Value::Array(items) => items.iter().filter_map(detail_entry).collect(),
        Value::Object(_) | Value::String(_) => detail_entry(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn detail_entry(value: &Value) -> Option<FindingDetail> {
    match value {
        Value::Object(map) => {
            let pick = |keys: &[&str]| {
                keys.iter()
                    .filter_map(|key| map.get(*key))
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .find(|s| !s.is_empty())
                    .map(str::to_string)
            };
            Some(FindingDetail {
                detail_type: pick(&DETAIL_TYPE_KEYS).unwrap_or_else(|| "finding".to_string()),
                description: pick(&DETAIL_TEXT_KEYS).unwrap_or_else(|| value.to_string()),
                source: pick(&DETAIL_SOURCE_KEYS),
            })
        }
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(FindingDetail {
            detail_type: "finding".to_string(),
            description: s.trim().to_string(),
            source: None,
        }),
        other => Some(FindingDetail {
            detail_type: "finding".to_string(),
            description: other.to_string(),
            source: None,
        }),
    }
}

fn source_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => ["url", "link", "source"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(Value::as_str),
        _ => None,
    }
}

fn confidence(object: &Map<String, Value>) -> Option<f64> {
    CONFIDENCE_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        })
}
