//! 应用状态

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::{MAX_RUN_HISTORY, STREAM_SUBSCRIBER_CAPACITY};
use crate::config::EnvConfig;
use crate::error::{EngineError, EngineResult};
use crate::services::deploy::DeploymentOrchestrator;
use crate::services::ssh::{default_ssh_dir, ConnectionManager, Connector, RusshConnector};

use super::credential_store::CredentialStore;
use super::run_store::RunStore;
use super::stream_hub::StreamHub;

/// 历史运行保留时间（小时）
const RUN_RETENTION_HOURS: i64 = 24 * 7;

/// 关闭时等待活跃运行结束的上限
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 本地 SSH 密钥目录
    pub ssh_dir: Option<PathBuf>,

    // ========== 持久化与运行状态 ==========
    /// 连接配置与应用配置
    pub store: Arc<CredentialStore>,
    /// 部署运行
    pub runs: Arc<RunStore>,
    /// 输出流
    pub hub: Arc<StreamHub>,

    // ========== 远程 ==========
    /// SSH 会话管理
    pub connections: Arc<ConnectionManager>,
    /// 部署编排
    pub orchestrator: DeploymentOrchestrator,

    /// 优雅关闭后台任务
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// 打开数据目录并使用 russh 连接器创建状态
    pub async fn new(config: EnvConfig) -> EngineResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| EngineError::Store(format!(
                "cannot create {}: {}",
                config.data_dir.display(),
                e
            )))?;
        let store = CredentialStore::open(&config.data_dir).await?;
        let connector = Arc::new(RusshConnector::new(config.ssh.clone()));

        tracing::info!(
            api_key_len = config.api_key.len(),
            data_dir = %config.data_dir.display(),
            "Application state initialized"
        );

        Ok(Self::with_connector(config, store, connector))
    }

    /// 使用指定连接器创建状态
    pub fn with_connector(config: EnvConfig, store: CredentialStore, connector: Arc<dyn Connector>) -> Self {
        let runs = Arc::new(RunStore::with_config(MAX_RUN_HISTORY, RUN_RETENTION_HOURS));
        let hub = Arc::new(StreamHub::with_limits(
            config.stream_backlog_bytes,
            STREAM_SUBSCRIBER_CAPACITY,
        ));
        let connections = Arc::new(ConnectionManager::new(connector, config.ssh.clone()));
        let orchestrator = DeploymentOrchestrator::new(
            connections.clone(),
            runs.clone(),
            hub.clone(),
            config.deploy.clone(),
        );

        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            ssh_dir: default_ssh_dir(),
            store: Arc::new(store),
            runs,
            hub,
            connections,
            orchestrator,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// 周期维护：清理结束的输出通道、空闲会话与过期运行
    pub async fn maintenance(&self) {
        self.hub.cleanup().await;
        let evicted = self.connections.evict_idle().await;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle SSH sessions");
        }
        self.runs.cleanup_stale().await;
    }

    /// 关闭：取消活跃运行，等待它们终止远程进程并写入终态，
    /// 然后结束全部输出流并断开会话
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.runs.cancel_all().await;

        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while self.runs.active_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            let active = self.runs.active_count().await;
            tracing::warn!(
                active = active,
                "Deployments still running at shutdown"
            );
        }

        self.hub.finish_all().await;
        self.connections.close_all().await;
    }
}
