//! Remote Deploy Engine - 远程部署编排引擎
//!
//! 通过 SSH 管理单台远程主机：连接、文件、容器与部署流水线

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::env::constants::{MAINTENANCE_INTERVAL_SECS, VERSION};
use config::EnvConfig;
use state::AppState;

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
    /// 覆盖数据目录
    pub data_dir_override: Option<PathBuf>,
}

/// 初始化日志（`RUST_LOG`，默认 info）
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// 启动引擎并阻塞直到收到关闭信号
pub async fn run(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    if let Some(dir) = runtime.data_dir_override {
        config.data_dir = dir;
    }
    let port = config.port;

    let state = Arc::new(
        AppState::new(config)
            .await
            .context("failed to initialize engine state")?,
    );
    let maintenance = spawn_maintenance(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!(port, version = VERSION, "Remote deploy engine listening");

    // 收到信号后关闭运行、输出流与会话
    let shutdown_state = state.clone();
    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down");
            shutdown_state.shutdown().await;
        })
        .await
        .context("server error")?;

    let _ = maintenance.await;
    Ok(())
}

/// 后台维护循环，关闭时退出
fn spawn_maintenance(state: Arc<AppState>) -> JoinHandle<()> {
    let token = state.shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        // 第一次 tick 立即返回
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => state.maintenance().await,
            }
        }
        debug!("Maintenance loop stopped");
    })
}

/// Ctrl-C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
