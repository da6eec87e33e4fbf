pub mod metrics_collector;
pub mod telemetry_setup;

pub use metrics_collector::{
    AnalysisTypeStats, MetricsSnapshot, ModelStats, RecentError, WorkerMetrics,
};
pub use telemetry_setup::{init_logging, install_prometheus_recorder};
