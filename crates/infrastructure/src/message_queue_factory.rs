use std::sync::Arc;
use tracing::{debug, info};

use screening_config::{MessageQueueConfig, MessageQueueType};
use screening_domain::{JobPublisher, MessageSubscription};
use screening_errors::{ScreeningError, ScreeningResult};

use crate::{InMemoryMessageQueue, RabbitMQMessageQueue};

/// 同一队列的订阅端与发布端
#[derive(Clone)]
pub struct QueueHandles {
    pub subscription: Arc<dyn MessageSubscription>,
    pub publisher: Arc<dyn JobPublisher>,
}

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(
        config: &MessageQueueConfig,
        consumer_tag: &str,
    ) -> ScreeningResult<QueueHandles> {
        debug!("Creating message queue with type: {:?}", config.r#type);
        Self::validate_config(config)?;

        match config.r#type {
            MessageQueueType::Rabbitmq => {
                info!("Initializing RabbitMQ subscription");
                let rabbitmq = Arc::new(RabbitMQMessageQueue::new(config, consumer_tag).await?);
                Ok(QueueHandles {
                    subscription: rabbitmq.clone(),
                    publisher: rabbitmq,
                })
            }
            MessageQueueType::InMemory => {
                info!("Initializing in-memory subscription");
                let queue = Arc::new(InMemoryMessageQueue::new(config.subscription.clone()));
                Ok(QueueHandles {
                    subscription: queue.clone(),
                    publisher: queue,
                })
            }
        }
    }

    pub fn validate_config(config: &MessageQueueConfig) -> ScreeningResult<()> {
        if config.subscription.trim().is_empty() {
            return Err(ScreeningError::config_error("订阅名称不能为空"));
        }
        if config.r#type == MessageQueueType::Rabbitmq
            && !config.url.starts_with("amqp://")
            && !config.url.starts_with("amqps://")
        {
            return Err(ScreeningError::config_error(
                "RabbitMQ URL必须以amqp://或amqps://开头",
            ));
        }
        Ok(())
    }
}
