use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// 进程内的任务处理指标
///
/// 在启动时创建并显式传给消费者和HTTP层；同时把计数转发给 `metrics` 门面，
/// 安装了 Prometheus recorder 时即可被抓取。
pub struct WorkerMetrics {
    state: Mutex<MetricsState>,
    started_at: DateTime<Utc>,
    started: Instant,
    max_timing_samples: usize,
    max_error_samples: usize,
}

#[derive(Default)]
struct MetricsState {
    total_jobs: u64,
    successful_jobs: u64,
    failed_jobs: u64,
    model_attempts: u64,
    by_analysis_type: HashMap<String, AnalysisTypeStats>,
    by_model: HashMap<String, ModelStats>,
    error_kinds: HashMap<String, u64>,
    timings: VecDeque<f64>,
    recent_errors: VecDeque<RecentError>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AnalysisTypeStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ModelStats {
    pub successful: u64,
    pub failed: u64,
    pub attempts: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecentError {
    pub job_id: String,
    pub analysis_type: String,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub success_rate: f64,
    pub average_processing_time_seconds: f64,
    pub jobs_per_hour: f64,
    pub model_attempts: u64,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub by_analysis_type: HashMap<String, AnalysisTypeStats>,
    pub by_model: HashMap<String, ModelStats>,
    pub error_kinds: HashMap<String, u64>,
    pub recent_errors: Vec<RecentError>,
}

impl WorkerMetrics {
    pub fn new(max_timing_samples: usize, max_error_samples: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            started_at: Utc::now(),
            started: Instant::now(),
            max_timing_samples: max_timing_samples.max(1),
            max_error_samples: max_error_samples.max(1),
        }
    }

    fn with_state<F: FnOnce(&mut MetricsState)>(&self, f: F) {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => {
                warn!("指标锁已损坏，继续使用内部状态");
                f(&mut poisoned.into_inner())
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_job_start(&self, analysis_type: &str) {
        counter!("screening_jobs_started_total", "analysis_type" => analysis_type.to_string())
            .increment(1);
    }

    pub fn record_job_success(&self, analysis_type: &str, model: &str, duration: Duration) {
        counter!("screening_jobs_total", "analysis_type" => analysis_type.to_string(), "outcome" => "completed")
            .increment(1);
        histogram!("screening_job_duration_seconds", "analysis_type" => analysis_type.to_string())
            .record(duration.as_secs_f64());

        let max_timings = self.max_timing_samples;
        self.with_state(|state| {
            state.total_jobs += 1;
            state.successful_jobs += 1;
            let stats = state
                .by_analysis_type
                .entry(analysis_type.to_string())
                .or_default();
            stats.total += 1;
            stats.successful += 1;
            state.by_model.entry(model.to_string()).or_default().successful += 1;
            push_bounded(&mut state.timings, duration.as_secs_f64(), max_timings);
        });
    }

    pub fn record_job_failure(
        &self,
        job_id: &str,
        analysis_type: &str,
        model: Option<&str>,
        kind: &str,
        message: &str,
        duration: Duration,
    ) {
        counter!("screening_jobs_total", "analysis_type" => analysis_type.to_string(), "outcome" => "failed")
            .increment(1);
        counter!("screening_jobs_failed_total", "kind" => kind.to_string()).increment(1);
        histogram!("screening_job_duration_seconds", "analysis_type" => analysis_type.to_string())
            .record(duration.as_secs_f64());

        let max_timings = self.max_timing_samples;
        let max_errors = self.max_error_samples;
        let error = RecentError {
            job_id: job_id.to_string(),
            analysis_type: analysis_type.to_string(),
            kind: kind.to_string(),
            message: message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect(),
            timestamp: Utc::now(),
        };
        self.with_state(|state| {
            state.total_jobs += 1;
            state.failed_jobs += 1;
            let stats = state
                .by_analysis_type
                .entry(analysis_type.to_string())
                .or_default();
            stats.total += 1;
            stats.failed += 1;
            if let Some(model) = model {
                state.by_model.entry(model.to_string()).or_default().failed += 1;
            }
            *state.error_kinds.entry(kind.to_string()).or_default() += 1;
            push_bounded(&mut state.timings, duration.as_secs_f64(), max_timings);
            push_bounded(&mut state.recent_errors, error, max_errors);
        });
    }

    /// outcome 为 success / retryable_error / fatal_error
    pub fn record_model_attempt(&self, model: &str, outcome: &'static str, elapsed: Duration) {
        counter!("screening_model_attempts_total", "model" => model.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!("screening_model_attempt_duration_seconds", "model" => model.to_string())
            .record(elapsed.as_secs_f64());

        self.with_state(|state| {
            state.model_attempts += 1;
            state.by_model.entry(model.to_string()).or_default().attempts += 1;
        });
    }

    pub fn record_message_ignored(&self, reason: &'static str) {
        counter!("screening_messages_ignored_total", "reason" => reason).increment(1);
    }

    pub fn record_redelivery_requested(&self) {
        counter!("screening_messages_nacked_total").increment(1);
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        gauge!("screening_jobs_in_flight").set(in_flight as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime();
        let mut snapshot = MetricsSnapshot {
            total_jobs: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            success_rate: 0.0,
            average_processing_time_seconds: 0.0,
            jobs_per_hour: 0.0,
            model_attempts: 0,
            uptime_seconds: uptime.as_secs(),
            started_at: self.started_at,
            by_analysis_type: HashMap::new(),
            by_model: HashMap::new(),
            error_kinds: HashMap::new(),
            recent_errors: Vec::new(),
        };

        self.with_state(|state| {
            snapshot.total_jobs = state.total_jobs;
            snapshot.successful_jobs = state.successful_jobs;
            snapshot.failed_jobs = state.failed_jobs;
            snapshot.model_attempts = state.model_attempts;
            if state.total_jobs > 0 {
                snapshot.success_rate =
                    state.successful_jobs as f64 / state.total_jobs as f64 * 100.0;
            }
            if !state.timings.is_empty() {
                snapshot.average_processing_time_seconds =
                    state.timings.iter().sum::<f64>() / state.timings.len() as f64;
            }
            let hours = uptime.as_secs_f64() / 3600.0;
            if hours > 0.0 {
                snapshot.jobs_per_hour = state.total_jobs as f64 / hours;
            }
            snapshot.by_analysis_type = state.by_analysis_type.clone();
            snapshot.by_model = state.by_model.clone();
            snapshot.error_kinds = state.error_kinds.clone();
            snapshot.recent_errors = state.recent_errors.iter().cloned().collect();
        });

        snapshot
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T, max: usize) {
    while buffer.len() >= max {
        buffer.pop_front();
    }
    buffer.push_back(value);
}
