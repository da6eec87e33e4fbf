//! 模型调用的重试策略
//!
//! 退避延迟由 [`BackoffSchedule`] 迭代产生，与具体的睡眠实现解耦，
//! 测试中可以注入固定抖动和记录型 [`Sleeper`]。

use async_trait::async_trait;
use screening_config::ModelConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次调用之后的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_seconds),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// base_delay * 2^retry * jitter，尚未做单调和上限处理
    fn jittered_delay(&self, retry: u32, jitter: f64) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(retry as i32);
        Duration::from_secs_f64((exponential * jitter).max(0.0))
    }

    pub fn schedule<'a>(&'a self, jitter: &'a dyn JitterSource) -> BackoffSchedule<'a> {
        BackoffSchedule {
            policy: self,
            jitter,
            retry: 0,
            previous: Duration::ZERO,
        }
    }
}

/// 产生 max_retries 个非递减且不超过上限的延迟
pub struct BackoffSchedule<'a> {
    policy: &'a RetryPolicy,
    jitter: &'a dyn JitterSource,
    retry: u32,
    previous: Duration,
}

impl Iterator for BackoffSchedule<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retry >= self.policy.max_retries {
            return None;
        }
        let jittered = self
            .policy
            .jittered_delay(self.retry, self.jitter.sample());
        let delay = jittered.max(self.previous).min(self.policy.max_delay);
        self.retry += 1;
        self.previous = delay;
        Some(delay)
    }
}

/// 抖动系数来源，取值范围 [0.5, 1.5)
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::random_range(0.5..1.5)
    }
}

pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
