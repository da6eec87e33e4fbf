use async_trait::async_trait;
use screening_domain::{Delivery, JobMessage, JobPublisher, MessageSubscription};
use screening_errors::{ScreeningError, ScreeningResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// 内存消息队列实现
///
/// 使用 Tokio channel 模拟单一订阅：nack 的消息以新的投递ID重新入队，
/// `close` 之后队列排空即结束。用于嵌入式运行和测试。
pub struct InMemoryMessageQueue {
    name: String,
    sender: StdMutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    in_flight: StdMutex<HashMap<String, Delivery>>,
    acked: StdMutex<Vec<String>>,
    nacked: StdMutex<Vec<String>>,
    next_id: AtomicU64,
}

impl InMemoryMessageQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        info!("创建内存消息队列: {}", name);
        Self {
            name,
            sender: StdMutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            in_flight: StdMutex::new(HashMap::new()),
            acked: StdMutex::new(Vec::new()),
            nacked: StdMutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_delivery_id(&self) -> String {
        format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn enqueue(&self, data: Vec<u8>, attempt: u32) -> ScreeningResult<String> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| ScreeningError::message_queue("内存队列锁已损坏"))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| ScreeningError::message_queue(format!("队列 {} 已关闭", self.name)))?;

        let mut delivery = Delivery::new(self.next_delivery_id(), data);
        delivery.attempt = attempt;
        let delivery_id = delivery.delivery_id.clone();
        sender
            .send(delivery)
            .map_err(|_| ScreeningError::message_queue(format!("队列 {} 已关闭", self.name)))?;
        Ok(delivery_id)
    }

    /// 发布原始字节，返回投递ID
    pub fn publish_raw(&self, data: impl Into<Vec<u8>>) -> ScreeningResult<String> {
        self.enqueue(data.into(), 1)
    }

    /// 停止接收新消息，已入队的消息仍可取出
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if sender.take().is_some() {
                debug!("内存队列 {} 已关闭", self.name);
            }
        }
    }

    fn take_in_flight(&self, delivery_id: &str) -> ScreeningResult<Delivery> {
        self.in_flight
            .lock()
            .map_err(|_| ScreeningError::message_queue("内存队列锁已损坏"))?
            .remove(delivery_id)
            .ok_or_else(|| {
                ScreeningError::message_queue(format!("投递 {delivery_id} 不存在或已处理"))
            })
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn nacked_ids(&self) -> Vec<String> {
        self.nacked.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageSubscription for InMemoryMessageQueue {
    async fn receive(&self) -> ScreeningResult<Option<Delivery>> {
        let delivery = self.receiver.lock().await.recv().await;
        if let Some(delivery) = &delivery {
            self.in_flight
                .lock()
                .map_err(|_| ScreeningError::message_queue("内存队列锁已损坏"))?
                .insert(delivery.delivery_id.clone(), delivery.clone());
        }
        Ok(delivery)
    }

    async fn ack(&self, delivery_id: &str) -> ScreeningResult<()> {
        self.take_in_flight(delivery_id)?;
        if let Ok(mut acked) = self.acked.lock() {
            acked.push(delivery_id.to_string());
        }
        debug!(delivery_id, "消息已确认");
        Ok(())
    }

    async fn nack(&self, delivery_id: &str) -> ScreeningResult<()> {
        let delivery = self.take_in_flight(delivery_id)?;
        if let Ok(mut nacked) = self.nacked.lock() {
            nacked.push(delivery_id.to_string());
        }
        match self.enqueue(delivery.data, delivery.attempt + 1) {
            Ok(redelivery_id) => debug!(delivery_id, %redelivery_id, "消息已重新入队"),
            Err(e) => debug!(delivery_id, error = %e, "队列已关闭，消息未重新入队"),
        }
        Ok(())
    }

    fn subscription_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl JobPublisher for InMemoryMessageQueue {
    async fn publish(&self, message: &JobMessage) -> ScreeningResult<()> {
        let payload = message.encode()?;
        self.enqueue(payload, 1)?;
        Ok(())
    }
}
