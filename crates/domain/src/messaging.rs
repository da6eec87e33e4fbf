use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::messages::JobMessage;
use screening_errors::ScreeningResult;

/// 从订阅中取出的一条消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub data: Vec<u8>,
    /// 投递次数，从 1 开始
    pub attempt: u32,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(delivery_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            data,
            attempt: 1,
            received_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 单一订阅的拉取接口，每条消息必须恰好 ack 或 nack 一次
#[async_trait]
pub trait MessageSubscription: Send + Sync {
    /// 订阅关闭时返回 `None`
    async fn receive(&self) -> ScreeningResult<Option<Delivery>>;
    async fn ack(&self, delivery_id: &str) -> ScreeningResult<()>;
    /// 重新投递
    async fn nack(&self, delivery_id: &str) -> ScreeningResult<()>;
    fn subscription_name(&self) -> &str;
}

/// 发布任务消息，供本地工具和测试使用
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, message: &JobMessage) -> ScreeningResult<()>;
}
