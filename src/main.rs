use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use screening_config::{AppConfig, LogFormat, LogLevel};

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

/// 关闭总超时在 drain + grace 之外额外留出的余量
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("screening-worker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("名称筛查文本分析 worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("覆盖配置中的 worker_id"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = id.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format =
            format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
    }

    screening_observability::init_logging(
        config.observability.log_level,
        config.observability.log_format,
    )?;

    info!(
        worker_id = %config.worker.worker_id,
        subscription = %config.message_queue.subscription,
        "启动名称筛查 worker"
    );

    let shutdown_timeout = Duration::from_secs(
        config.worker.drain_timeout_seconds + config.worker.abort_grace_seconds,
    ) + SHUTDOWN_MARGIN;

    let app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();
    let mut app_handle = tokio::spawn(app.run(shutdown_manager.clone()));

    let finished_early = tokio::select! {
        result = &mut app_handle => Some(result),
        _ = wait_for_shutdown_signal() => None,
    };

    let outcome = match finished_early {
        Some(result) => result,
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
            match tokio::time::timeout(shutdown_timeout, app_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?shutdown_timeout, "应用关闭超时，强制退出");
                    return Ok(());
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => {
            error!(error = %e, "应用运行失败");
            return Err(e);
        }
        Err(e) => {
            error!(error = %e, "应用任务异常终止");
            return Err(e.into());
        }
    }

    info!("名称筛查 worker 已退出");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "安装Ctrl+C信号处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "安装SIGTERM信号处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
