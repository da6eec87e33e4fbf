//! 订阅拉取循环
//!
//! 在途额度由与推送入口共享的 [`FlowGate`] 约束。收到关闭信号后停止拉取并关闭闸门，
//! 先等待两条路径上的在途任务排空，超时后发出中止信号，宽限期过后强制终止剩余任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use screening_domain::MessageSubscription;
use screening_errors::ScreeningResult;
use screening_observability::WorkerMetrics;

use crate::abort::AbortHandle;
use crate::dispatcher::{AckDecision, MessageDispatcher};
use crate::flow::FlowGate;

pub struct QueueConsumer {
    subscription: Arc<dyn MessageSubscription>,
    dispatcher: Arc<MessageDispatcher>,
    metrics: Arc<WorkerMetrics>,
    gate: Arc<FlowGate>,
    abort: AbortHandle,
    drain_timeout: Duration,
    abort_grace: Duration,
    reconnect_delay: Duration,
}

impl QueueConsumer {
    pub fn new(
        subscription: Arc<dyn MessageSubscription>,
        dispatcher: Arc<MessageDispatcher>,
        metrics: Arc<WorkerMetrics>,
        gate: Arc<FlowGate>,
    ) -> Self {
        Self {
            subscription,
            dispatcher,
            metrics,
            gate,
            abort: AbortHandle::new(),
            drain_timeout: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_timeouts(mut self, drain_timeout: Duration, abort_grace: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self.abort_grace = abort_grace;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> ScreeningResult<()> {
        let mut tasks = JoinSet::new();
        let activity = self.dispatcher.activity();
        let flow = self.gate.flow_control();

        activity.set_running(true);
        info!(
            subscription = self.subscription.subscription_name(),
            max_messages = flow.max_messages,
            max_bytes = flow.max_bytes,
            "开始消费任务消息"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_result(joined);
            }
            self.metrics.set_in_flight(self.gate.in_flight());

            let slot = tokio::select! {
                _ = shutdown.recv() => break,
                slot = self.gate.reserve_slot() => slot?,
            };

            let received = tokio::select! {
                _ = shutdown.recv() => break,
                received = self.subscription.receive() => received,
            };
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    info!("订阅已关闭，停止拉取");
                    break;
                }
                Err(e) => {
                    error!(error = %e, delay_secs = self.reconnect_delay.as_secs(), "拉取消息失败，稍后重试");
                    drop(slot);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => continue,
                    }
                }
            };

            let permit = tokio::select! {
                _ = shutdown.recv() => {
                    settle(self.subscription.as_ref(), &delivery.delivery_id, AckDecision::Nack).await;
                    break;
                }
                permit = self.gate.admit(slot, delivery.size()) => permit?,
            };

            debug!(delivery_id = %delivery.delivery_id, size = delivery.size(), "收到消息");
            let dispatcher = Arc::clone(&self.dispatcher);
            let subscription = Arc::clone(&self.subscription);
            let signal = self.abort.signal();
            tasks.spawn(async move {
                let _permit = permit;
                let decision = dispatcher.handle(&delivery, &signal).await;
                settle(subscription.as_ref(), &delivery.delivery_id, decision).await;
            });
            self.metrics.set_in_flight(self.gate.in_flight());
        }

        activity.set_running(false);
        self.gate.close();
        self.drain(&mut tasks).await;
        self.metrics.set_in_flight(0);
        info!("消费循环已停止");
        Ok(())
    }

    /// 推送入口的任务不在 JoinSet 中，靠闸门许可全部归还来判断是否排空
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() && self.gate.in_flight() == 0 {
            return;
        }
        info!(
            in_flight = self.gate.in_flight(),
            drain_secs = self.drain_timeout.as_secs(),
            "等待在途任务完成"
        );
        if tokio::time::timeout(self.drain_timeout, self.settle_all(tasks))
            .await
            .is_ok()
        {
            return;
        }

        warn!(remaining = self.gate.in_flight(), "排空超时，中止在途的模型调用");
        self.abort.abort();
        if tokio::time::timeout(self.abort_grace, self.settle_all(tasks))
            .await
            .is_ok()
        {
            return;
        }

        warn!(remaining = self.gate.in_flight(), "中止宽限期已过，强制终止剩余任务");
        tasks.abort_all();
        join_all(tasks).await;
    }

    async fn settle_all(&self, tasks: &mut JoinSet<()>) {
        join_all(tasks).await;
        self.gate.wait_idle().await;
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        log_join_result(joined);
    }
}

fn log_join_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_cancelled() {
            warn!("在途任务被强制终止，消息未确认");
        } else {
            error!(error = %e, "在途任务异常退出");
        }
    }
}

async fn settle(subscription: &dyn MessageSubscription, delivery_id: &str, decision: AckDecision) {
    let result = match decision {
        AckDecision::Ack => subscription.ack(delivery_id).await,
        AckDecision::Nack => subscription.nack(delivery_id).await,
    };
    match result {
        Ok(()) => debug!(delivery_id, ?decision, "消息已处理"),
        Err(e) => error!(delivery_id, ?decision, error = %e, "确认消息失败"),
    }
}
