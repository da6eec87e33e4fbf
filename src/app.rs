use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use screening_api::{create_app, serve, AppState, ServiceInfo};
use screening_config::AppConfig;
use screening_infrastructure::{JobRepositoryFactory, MessageQueueFactory};
use screening_observability::{install_prometheus_recorder, WorkerMetrics};
use screening_worker::{HttpModelClient, WorkerService};

use crate::shutdown::ShutdownManager;

/// 主应用程序：拉取 worker 与 HTTP 服务
pub struct Application {
    config: AppConfig,
    service: Arc<WorkerService>,
    api_state: AppState,
}

impl Application {
    /// 按配置连接任务存储、消息队列和模型服务
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!(worker_id = %config.worker.worker_id, "初始化应用程序");

        let metrics = Arc::new(WorkerMetrics::new(
            config.observability.max_timing_samples,
            config.observability.max_error_samples,
        ));
        let prometheus = if config.observability.metrics_enabled {
            Some(install_prometheus_recorder()?)
        } else {
            None
        };

        let job_repository = JobRepositoryFactory::create(&config.job_store)
            .await
            .context("创建任务存储失败")?;
        let queue = MessageQueueFactory::create(&config.message_queue, &config.worker.worker_id)
            .await
            .context("创建消息队列失败")?;
        let model_client = Arc::new(
            HttpModelClient::new(&config.model)
                .context("创建模型客户端失败")?
                .with_metrics(Arc::clone(&metrics)),
        );

        let service = Arc::new(
            WorkerService::builder(
                config.worker.worker_id.clone(),
                queue.subscription,
                job_repository,
                model_client,
            )
            .configure(&config)
            .metrics(Arc::clone(&metrics))
            .build(),
        );

        let api_state = AppState {
            info: ServiceInfo {
                service: "text-analysis-worker".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                hostname: local_hostname(),
            },
            activity: service.activity(),
            metrics,
            prometheus,
            dispatcher: config
                .api
                .push_endpoint_enabled
                .then(|| service.dispatcher()),
            gate: service.flow_gate(),
            abort: service.abort_handle().signal(),
        };

        Ok(Self {
            config,
            service,
            api_state,
        })
    }

    /// 运行到收到关闭信号；worker 自行退出时也会触发整体关闭
    pub async fn run(self, shutdown_manager: ShutdownManager) -> Result<()> {
        let api_task = if self.config.api.enabled {
            let router = create_app(self.api_state.clone());
            let bind_address = self.config.api.bind_address.clone();
            let shutdown_rx = shutdown_manager.subscribe().await;
            Some(tokio::spawn(async move {
                serve(router, &bind_address, shutdown_rx).await
            }))
        } else {
            info!("HTTP服务未启用");
            None
        };

        let worker_result = self.service.run(shutdown_manager.subscribe().await).await;
        if let Err(e) = &worker_result {
            error!(error = %e, "Worker服务异常退出");
        }
        shutdown_manager.shutdown().await;

        if let Some(api_task) = api_task {
            match api_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "HTTP服务异常退出"),
                Err(e) => error!(error = %e, "HTTP服务任务失败"),
            }
        }

        worker_result.context("Worker服务运行失败")
    }
}

fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "无法获取主机名");
            "unknown".to_string()
        }
    }
}
