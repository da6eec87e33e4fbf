use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::warn;

const MAX_REPORTED_ACTIVE_JOBS: usize = 10;

/// 进程内的 worker 活动簿记，启动时创建，由消费者和HTTP层共享
pub struct WorkerActivity {
    worker_id: String,
    subscription: String,
    max_workers: usize,
    running: AtomicBool,
    started_at: DateTime<Utc>,
    started: Instant,
    processed: AtomicU64,
    failed: AtomicU64,
    active: Mutex<HashMap<String, ActiveJob>>,
}

#[derive(Debug, Clone)]
struct ActiveJob {
    job_id: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub worker_id: String,
    pub uptime_seconds: u64,
    pub processed_jobs: u64,
    pub failed_jobs: u64,
    pub active_jobs: usize,
    /// 最多列出 10 个
    pub active_job_ids: Vec<String>,
    pub max_workers: usize,
    pub subscription: String,
    pub start_time: DateTime<Utc>,
}

impl WorkerActivity {
    pub fn new(
        worker_id: impl Into<String>,
        subscription: impl Into<String>,
        max_workers: usize,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            subscription: subscription.into(),
            max_workers,
            running: AtomicBool::new(false),
            started_at: Utc::now(),
            started: Instant::now(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active_jobs(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("活动任务表的锁已损坏，继续使用内部状态");
                poisoned.into_inner()
            }
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 登记一条正在处理的消息，guard 释放时自动移除
    pub fn track(self: &Arc<Self>, delivery_id: &str, job_id: &str) -> ActiveJobGuard {
        self.active_jobs().insert(
            delivery_id.to_string(),
            ActiveJob {
                job_id: job_id.to_string(),
                started_at: Utc::now(),
            },
        );
        ActiveJobGuard {
            activity: Arc::clone(self),
            delivery_id: delivery_id.to_string(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs().len()
    }

    pub fn status(&self) -> WorkerStatus {
        let active = self.active_jobs();
        let mut jobs: Vec<&ActiveJob> = active.values().collect();
        jobs.sort_by_key(|job| job.started_at);
        WorkerStatus {
            running: self.is_running(),
            worker_id: self.worker_id.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            processed_jobs: self.processed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            active_jobs: active.len(),
            active_job_ids: jobs
                .into_iter()
                .take(MAX_REPORTED_ACTIVE_JOBS)
                .map(|job| job.job_id.clone())
                .collect(),
            max_workers: self.max_workers,
            subscription: self.subscription.clone(),
            start_time: self.started_at,
        }
    }
}

pub struct ActiveJobGuard {
    activity: Arc<WorkerActivity>,
    delivery_id: String,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.activity.active_jobs().remove(&self.delivery_id);
    }
}
