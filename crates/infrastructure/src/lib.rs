pub mod database;
pub mod in_memory_queue;
pub mod message_queue;
pub mod message_queue_factory;

pub use database::{InMemoryJobRepository, JobRepositoryFactory, PostgresJobRepository};
pub use in_memory_queue::InMemoryMessageQueue;
pub use message_queue::RabbitMQMessageQueue;
pub use message_queue_factory::{MessageQueueFactory, QueueHandles};
