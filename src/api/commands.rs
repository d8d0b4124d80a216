//! 命令 API
//!
//! POST /commands

use axum::{extract::State, routing::post, Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::domain::command::{Command, CommandOutcome};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::dispatch::dispatch;
use crate::state::AppState;

/// 创建命令路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/commands", post(execute_command))
}

/// 执行命令
///
/// 请求体格式错误（未知命令、参数缺失、凭据同时提供密码与私钥）返回 400
async fn execute_command(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<CommandOutcome>> {
    let command: Command =
        serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("invalid command: {}", e)))?;
    let name = command.name();
    let started = Instant::now();

    match dispatch(&state, command).await {
        Ok(outcome) => {
            info!(
                command = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Command completed"
            );
            Ok(Json(outcome))
        }
        Err(e) => {
            warn!(command = name, error_kind = e.kind(), error = %e, "Command failed");
            Err(e.into())
        }
    }
}
