//! 健康检查和运行状态 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::deploy::DeploymentRun;
use crate::middleware::RequireApiKey;
use crate::state::stream_hub::ChannelInfo;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    active_deploys: usize,
    ssh_sessions: usize,
}

/// 运行状态响应
#[derive(Debug, Serialize)]
struct StatusResponse {
    /// 已保存的连接目标（不含凭据）
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    applications: usize,
    active_runs: Vec<DeploymentRun>,
    history_count: usize,
    streams: Vec<ChannelInfo>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(engine_status))
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "remote-deploy-engine",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        active_deploys: state.runs.active_count().await,
        ssh_sessions: state.connections.session_count().await,
    })
}

/// 引擎状态：活跃运行、输出通道
///
/// GET /status
async fn engine_status(_auth: RequireApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        target: state.store.profile().await.map(|p| p.display_target()),
        applications: state.store.applications().await.len(),
        active_runs: state.runs.active_runs().await,
        history_count: state.runs.history_count().await,
        streams: state.hub.channels().await,
    })
}
