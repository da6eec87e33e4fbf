use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// 绑定地址并运行到收到关闭信号
pub async fn serve(
    router: Router,
    bind_address: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("无法绑定HTTP地址 {bind_address}"))?;
    let local_addr = listener.local_addr().context("无法获取监听地址")?;
    info!(%local_addr, "HTTP服务已启动");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("HTTP服务异常退出")?;

    info!("HTTP服务已停止");
    Ok(())
}
