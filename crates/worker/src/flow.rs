//! 在途消息的流控
//!
//! 拉取循环和推送入口共用同一个 [`FlowGate`]，消息数和字节数的上限对两条路径合计生效。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use screening_config::{MessageQueueConfig, WorkerConfig};
use screening_errors::{ScreeningError, ScreeningResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub max_messages: usize,
    pub max_bytes: usize,
}

impl FlowControl {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            max_messages: max_messages.clamp(1, u32::MAX as usize),
            max_bytes: max_bytes.clamp(1, u32::MAX as usize),
        }
    }

    /// 在途上限取队列预取数与 worker 并发数中较小的一个
    pub fn from_config(queue: &MessageQueueConfig, worker: &WorkerConfig) -> Self {
        Self::new(
            queue.max_in_flight_messages.min(worker.max_concurrent_jobs),
            queue.max_in_flight_bytes,
        )
    }

    /// 单条消息占用的字节许可，超大消息按上限计，避免永远无法获得许可
    fn weight(&self, size: usize) -> u32 {
        size.clamp(1, self.max_bytes) as u32
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(16, 100 * 1024 * 1024)
    }
}

/// 一条在途消息持有的许可，释放时归还槽位和字节额度
pub struct FlowPermit {
    _slot: OwnedSemaphorePermit,
    _bytes: OwnedSemaphorePermit,
}

/// 消息槽位与字节额度的共享闸门
pub struct FlowGate {
    flow: FlowControl,
    slots: Arc<Semaphore>,
    bytes: Arc<Semaphore>,
    closed: AtomicBool,
}

impl FlowGate {
    pub fn new(flow: FlowControl) -> Self {
        Self {
            flow,
            slots: Arc::new(Semaphore::new(flow.max_messages)),
            bytes: Arc::new(Semaphore::new(flow.max_bytes)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn flow_control(&self) -> FlowControl {
        self.flow
    }

    /// 拉取前先占一个槽位，收到消息后再用 [`FlowGate::admit`] 补齐字节额度
    pub async fn reserve_slot(&self) -> ScreeningResult<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ScreeningError::Internal("在途消息信号量已关闭".to_string()))
    }

    pub async fn admit(
        &self,
        slot: OwnedSemaphorePermit,
        size: usize,
    ) -> ScreeningResult<FlowPermit> {
        let bytes = Arc::clone(&self.bytes)
            .acquire_many_owned(self.flow.weight(size))
            .await
            .map_err(|_| ScreeningError::Internal("在途字节信号量已关闭".to_string()))?;
        Ok(FlowPermit {
            _slot: slot,
            _bytes: bytes,
        })
    }

    /// 不等待地申请许可；闸门关闭或额度不足时返回 `None`
    pub fn try_admit(&self, size: usize) -> Option<FlowPermit> {
        if self.is_closed() {
            return None;
        }
        let slot = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        let bytes = Arc::clone(&self.bytes)
            .try_acquire_many_owned(self.flow.weight(size))
            .ok()?;
        Some(FlowPermit {
            _slot: slot,
            _bytes: bytes,
        })
    }

    /// 占用中的槽位数，包括等待消息时预留的槽位
    pub fn in_flight(&self) -> usize {
        self.flow.max_messages - self.slots.available_permits()
    }

    /// 停止接纳推送的新消息，已持有的许可不受影响
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "流控闸门已关闭");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 等待所有许可归还
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.slots.acquire_many(self.flow.max_messages as u32).await {
            drop(all);
        }
    }
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new(FlowControl::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flow_control_limits() {
        let queue = MessageQueueConfig {
            max_in_flight_messages: 16,
            max_in_flight_bytes: 1024,
            ..MessageQueueConfig::default()
        };
        let worker = WorkerConfig {
            max_concurrent_jobs: 4,
            ..WorkerConfig::default()
        };
        let flow = FlowControl::from_config(&queue, &worker);
        assert_eq!(flow.max_messages, 4);
        assert_eq!(flow.max_bytes, 1024);
    }

    #[test]
    fn test_weight_is_clamped() {
        let flow = FlowControl::new(1, 100);
        assert_eq!(flow.weight(0), 1);
        assert_eq!(flow.weight(40), 40);
        assert_eq!(flow.weight(10_000), 100);
    }

    #[test]
    fn test_try_admit_respects_both_limits() {
        let gate = FlowGate::new(FlowControl::new(2, 100));

        let first = gate.try_admit(60).unwrap();
        assert!(gate.try_admit(60).is_none(), "字节额度不足");
        let second = gate.try_admit(40).unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_admit(1).is_none(), "槽位已满");

        drop(first);
        drop(second);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.try_admit(100).is_some());
    }

    #[tokio::test]
    async fn test_reserved_slot_counts_against_push() {
        let gate = FlowGate::new(FlowControl::new(1, 100));
        let slot = gate.reserve_slot().await.unwrap();
        assert!(gate.try_admit(10).is_none());

        let permit = gate.admit(slot, 10).await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        drop(permit);
        assert!(gate.try_admit(10).is_some());
    }

    #[tokio::test]
    async fn test_close_rejects_new_work_and_wait_idle_tracks_permits() {
        let gate = Arc::new(FlowGate::new(FlowControl::new(2, 100)));
        let held = gate.try_admit(10).unwrap();
        gate.close();
        assert!(gate.is_closed());
        assert!(gate.try_admit(10).is_none());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
