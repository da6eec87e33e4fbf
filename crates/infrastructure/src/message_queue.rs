use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    Consumer,
};
use screening_config::MessageQueueConfig;
use screening_domain::{Delivery, JobMessage, JobPublisher, MessageSubscription};
use screening_errors::{ScreeningError, ScreeningResult};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// RabbitMQ订阅实现
///
/// prefetch 限制同时在途的消息数，delivery_tag 作为投递ID用于 ack/nack
pub struct RabbitMQMessageQueue {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    queue_name: String,
}

impl RabbitMQMessageQueue {
    /// 连接RabbitMQ并开始消费配置的订阅队列
    pub async fn new(config: &MessageQueueConfig, consumer_tag: &str) -> ScreeningResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection =
            tokio::time::timeout(Duration::from_secs(config.connection_timeout_seconds), connect)
                .await
                .map_err(|_| {
                    ScreeningError::message_queue(format!(
                        "连接RabbitMQ超时 ({}s)",
                        config.connection_timeout_seconds
                    ))
                })?
                .map_err(|e| ScreeningError::message_queue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ScreeningError::message_queue(format!("创建通道失败: {e}")))?;

        let prefetch = u16::try_from(config.max_in_flight_messages).unwrap_or(u16::MAX);
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ScreeningError::message_queue(format!("设置预取数量失败: {e}")))?;

        Self::declare_queue(&channel, &config.subscription).await?;

        let consumer = channel
            .basic_consume(
                &config.subscription,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ScreeningError::message_queue(format!("创建消费者失败: {e}")))?;

        info!(
            subscription = %config.subscription,
            prefetch,
            "成功连接到RabbitMQ并开始消费"
        );

        Ok(Self {
            connection,
            channel,
            consumer: Mutex::new(consumer),
            queue_name: config.subscription.clone(),
        })
    }

    async fn declare_queue(channel: &Channel, queue_name: &str) -> ScreeningResult<()> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                ScreeningError::message_queue(format!("声明队列 {queue_name} 失败: {e}"))
            })?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }

    fn parse_tag(delivery_id: &str) -> ScreeningResult<u64> {
        delivery_id
            .parse::<u64>()
            .map_err(|_| ScreeningError::message_queue(format!("无效的投递ID: {delivery_id}")))
    }

    pub async fn publish_raw(&self, payload: &[u8]) -> ScreeningResult<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                ScreeningError::message_queue(format!(
                    "发布消息到队列 {} 失败: {e}",
                    self.queue_name
                ))
            })?;

        confirm
            .await
            .map_err(|e| ScreeningError::message_queue(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到队列: {}", self.queue_name);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> ScreeningResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| ScreeningError::message_queue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageSubscription for RabbitMQMessageQueue {
    async fn receive(&self) -> ScreeningResult<Option<Delivery>> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                delivery_id: delivery.delivery_tag.to_string(),
                attempt: if delivery.redelivered { 2 } else { 1 },
                data: delivery.data,
                received_at: Utc::now(),
            })),
            Some(Err(e)) => Err(ScreeningError::message_queue(format!(
                "从队列 {} 获取消息失败: {e}",
                self.queue_name
            ))),
            None => {
                warn!("队列 {} 的消费者已关闭", self.queue_name);
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery_id: &str) -> ScreeningResult<()> {
        let tag = Self::parse_tag(delivery_id)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| ScreeningError::message_queue(format!("确认消息失败: {e}")))?;
        debug!(delivery_id, "消息已确认");
        Ok(())
    }

    async fn nack(&self, delivery_id: &str) -> ScreeningResult<()> {
        let tag = Self::parse_tag(delivery_id)?;
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ScreeningError::message_queue(format!("拒绝消息失败: {e}")))?;
        debug!(delivery_id, "消息已拒绝并重新入队");
        Ok(())
    }

    fn subscription_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl JobPublisher for RabbitMQMessageQueue {
    async fn publish(&self, message: &JobMessage) -> ScreeningResult<()> {
        let payload = message.encode()?;
        self.publish_raw(&payload).await
    }
}
