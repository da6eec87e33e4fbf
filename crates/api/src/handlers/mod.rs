pub mod health;
pub mod metrics;
pub mod push;
pub mod root;
