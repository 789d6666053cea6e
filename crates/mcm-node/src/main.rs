//! 节点守护进程入口。
//!
//! 装配顺序：日志 → 配置 → 地址发现 → 协调代理子进程 → 路由器开通 →
//! 刷新工作者 → 控制循环。干净停机退出码为 0；初始化无法推进（地址
//! 发现失败、协调服务超预算不可达、恢复失败、引擎拒绝启动）时以非零
//! 码退出。

use std::sync::Arc;

use anyhow::Context;
use mcm_core::config::Settings;
use mcm_node::control::ControlLoop;
use mcm_node::refresher::spawn_refresher;
use mcm_node::{AppContext, address, agent};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MCM_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("loading configuration")?;

    let address = address::discover_address(
        &settings.coordination.bootstrap_service,
        settings.bind_interface.as_deref(),
    )
    .await
    .context("discovering the local address")?;

    let mut agent_process = agent::start_agent(&settings.coordination, &address.to_string())
        .await
        .context("starting the coordination agent")?;

    let ctx = Arc::new(AppContext::new(settings, address.to_string()));

    // 路由器的一次性开通；查询规则与用户配置之后不再重复下发。
    ctx.router
        .start_router()
        .await
        .context("starting the query router")?;
    ctx.router
        .initial_setup()
        .await
        .context("initial router setup")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (lost_tx, lost_rx) = mpsc::channel(4);

    let refresher = spawn_refresher(
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.registry),
        shutdown_rx.clone(),
        lost_tx,
    );

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    let mut control = ControlLoop::new(Arc::clone(&ctx), shutdown_rx, lost_rx);
    let result = control.run().await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = refresher.await {
        warn!(%err, "session refresher did not stop cleanly");
    }
    if let Err(err) = agent_process.start_kill() {
        warn!(%err, "coordination agent was already gone");
    }

    result.context("control loop")
}
