pub mod abort;
pub mod activity;
pub mod consumer;
pub mod dispatcher;
pub mod flow;
pub mod formatter;
pub mod model_client;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod tracker;

pub use abort::{AbortHandle, AbortSignal};
pub use activity::{ActiveJobGuard, WorkerActivity, WorkerStatus};
pub use consumer::QueueConsumer;
pub use dispatcher::{AckDecision, MessageDispatcher};
pub use flow::{FlowControl, FlowGate, FlowPermit};
pub use formatter::ResultFormatter;
pub use model_client::{
    validate_completion, AnalysisRequest, AttemptOutcome, ChatCompletion, HttpModelClient,
    ModelCallAttempt, ModelClient, ModelResponse,
};
pub use pipeline::{PipelineOutcome, TextAnalysisProcessor};
pub use retry::{BackoffSchedule, FixedJitter, JitterSource, RandomJitter, RetryPolicy, Sleeper, TokioSleeper};
pub use service::{WorkerService, WorkerServiceBuilder};
pub use tracker::JobStateTracker;
