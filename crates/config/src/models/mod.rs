pub mod api_observability;
pub mod app_config;
pub mod job_store;
pub mod logging;
pub mod message_queue;
pub mod model;
pub mod worker;

pub use api_observability::*;
pub use app_config::*;
pub use job_store::*;
pub use logging::*;
pub use message_queue::*;
pub use model::*;
pub use worker::*;
