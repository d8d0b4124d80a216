//! 统一错误处理
//!
//! 领域错误按组件划分（连接、传输、构建、发布、容器生命周期、并发），
//! 统一收敛到 `EngineError`；HTTP 层通过 `ApiError` 转换为 JSON 响应。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// SSH 连接错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("authentication failed for {user}@{host}")]
    AuthenticationFailed { host: String, user: String },

    #[error("host {host} unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },

    #[error("connection to {host} timed out")]
    Timeout { host: String },

    #[error("host key for {host} does not match known_hosts")]
    HostKeyMismatch { host: String },

    #[error("private key {path} cannot be used: {reason}")]
    InvalidKey { path: String, reason: String },

    #[error("ssh protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// 是否为可重试的临时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::HostUnreachable { .. } | ConnectError::Timeout { .. }
        )
    }
}

/// 远程命令执行错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecError {
    #[error("remote command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("remote command was cancelled")]
    Cancelled,

    #[error("ssh session disconnected: {0}")]
    Disconnected(String),

    #[error("ssh channel error: {0}")]
    Channel(String),

    #[error("local stream error: {0}")]
    Io(String),
}

impl ExecError {
    /// 会话是否已经不可用（需要从缓存中移除）
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ExecError::Disconnected(_))
    }
}

/// 文件传输错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("partial write to {path}: expected {expected} bytes")]
    PartialWrite { path: String, expected: u64 },

    #[error("{0} is a directory; directory deletion is not supported")]
    IsDirectory(String),

    #[error("transfer failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 构建错误
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("local container engine unavailable: {0}")]
    LocalEngineUnavailable(String),

    #[error("build command failed: {0}")]
    BuildCommandFailed(String),
}

/// 发布错误
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("no container reached running state within {0:?}")]
    HealthCheckTimeout(std::time::Duration),

    #[error("compose up failed: {0}")]
    ComposeFailed(String),
}

/// 容器生命周期错误
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("image {0} is still referenced by a container")]
    ImageInUse(String),

    #[error("container {0} is running; stop it first or pass force")]
    ContainerRunning(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("docker command failed: {0}")]
    CommandFailed(String),
}

/// 并发错误
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("a deployment for {0} is already in progress")]
    DeploymentAlreadyInProgress(String),
}

/// 配置校验错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid connection profile: {0}")]
    InvalidProfile(String),

    #[error("invalid application config: {0}")]
    InvalidApplication(String),

    #[error("no connection profile configured")]
    MissingProfile,
}

/// 密钥生成错误
#[derive(Debug, Error)]
pub enum KeyGenerationError {
    #[error("key file {0} already exists")]
    AlreadyExists(String),

    #[error("cannot locate ssh directory")]
    NoSshDirectory,

    #[error("key encoding failed: {0}")]
    Encoding(String),

    #[error("failed to write key: {0}")]
    Io(#[from] std::io::Error),
}

/// 引擎统一错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    KeyGeneration(#[from] KeyGenerationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("remote command failed: {0}")]
    Remote(String),
}

impl EngineError {
    /// 稳定的错误类型标识（用于 API 响应与运行记录）
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Connect(e) => match e {
                ConnectError::AuthenticationFailed { .. } => "connect.authentication_failed",
                ConnectError::HostUnreachable { .. } => "connect.host_unreachable",
                ConnectError::Timeout { .. } => "connect.timeout",
                ConnectError::HostKeyMismatch { .. } => "connect.host_key_mismatch",
                ConnectError::InvalidKey { .. } => "connect.invalid_key",
                ConnectError::Protocol(_) => "connect.protocol",
            },
            EngineError::Exec(e) => match e {
                ExecError::Timeout(_) => "exec.timeout",
                ExecError::Cancelled => "exec.cancelled",
                ExecError::Disconnected(_) => "exec.disconnected",
                ExecError::Channel(_) => "exec.channel",
                ExecError::Io(_) => "exec.io",
            },
            EngineError::Transfer(e) => match e {
                TransferError::PathNotFound(_) => "transfer.path_not_found",
                TransferError::PermissionDenied(_) => "transfer.permission_denied",
                TransferError::PartialWrite { .. } => "transfer.partial_write",
                TransferError::IsDirectory(_) => "transfer.is_directory",
                TransferError::Io(_) => "transfer.io",
            },
            EngineError::Build(e) => match e {
                BuildError::LocalEngineUnavailable(_) => "build.local_engine_unavailable",
                BuildError::BuildCommandFailed(_) => "build.build_command_failed",
            },
            EngineError::Rollout(e) => match e {
                RolloutError::HealthCheckTimeout(_) => "rollout.health_check_timeout",
                RolloutError::ComposeFailed(_) => "rollout.compose_failed",
            },
            EngineError::Lifecycle(e) => match e {
                LifecycleError::ImageInUse(_) => "lifecycle.image_in_use",
                LifecycleError::ContainerRunning(_) => "lifecycle.container_running",
                LifecycleError::ContainerNotFound(_) => "lifecycle.container_not_found",
                LifecycleError::CommandFailed(_) => "lifecycle.command_failed",
            },
            EngineError::Concurrency(_) => "concurrency.deployment_already_in_progress",
            EngineError::Config(_) => "config.invalid",
            EngineError::KeyGeneration(_) => "key_generation.failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::Store(_) => "store.failed",
            EngineError::Remote(_) => "remote.command_failed",
        }
    }

    /// 该错误是否意味着会话已损坏
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, EngineError::Exec(e) if e.is_session_fatal())
    }
}

/// 便捷类型别名
pub type EngineResult<T> = Result<T, EngineError>;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 引擎错误，保留错误类型
    Engine(EngineError),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

/// 引擎错误对应的 HTTP 状态码
fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Concurrency(_) | EngineError::KeyGeneration(KeyGenerationError::AlreadyExists(_)) => {
            StatusCode::CONFLICT
        }
        EngineError::Lifecycle(LifecycleError::ContainerNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Lifecycle(LifecycleError::ImageInUse(_) | LifecycleError::ContainerRunning(_)) => {
            StatusCode::CONFLICT
        }
        EngineError::Transfer(TransferError::PathNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Transfer(TransferError::PermissionDenied(_)) => StatusCode::FORBIDDEN,
        EngineError::Transfer(TransferError::IsDirectory(_)) => StatusCode::BAD_REQUEST,
        EngineError::Connect(ConnectError::Timeout { .. }) | EngineError::Exec(ExecError::Timeout(_)) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        EngineError::Store(_) | EngineError::KeyGeneration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("unauthorized", "Invalid or missing API key"),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("not_found", format!("{} not found", resource)),
            ),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new("bad_request", msg))
            }
            ApiError::Engine(err) => (
                engine_status(&err),
                ErrorResponse::new(err.kind(), err.to_string()),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Engine(e) => write!(f, "{}: {}", e.kind(), e),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("test_error", "Test message").with_details("Extra info");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.details, Some("Extra info".to_string()));
    }

    #[test]
    fn test_transient_connect_errors() {
        assert!(ConnectError::Timeout { host: "h".into() }.is_transient());
        assert!(ConnectError::HostUnreachable {
            host: "h".into(),
            reason: "refused".into()
        }
        .is_transient());
        assert!(!ConnectError::AuthenticationFailed {
            host: "h".into(),
            user: "u".into()
        }
        .is_transient());
    }

    #[test]
    fn test_engine_error_kind_preserved() {
        let err: EngineError =
            ConcurrencyError::DeploymentAlreadyInProgress("a1/staging".into()).into();
        assert_eq!(err.kind(), "concurrency.deployment_already_in_progress");
        assert_eq!(engine_status(&err), StatusCode::CONFLICT);

        let err: EngineError = BuildError::LocalEngineUnavailable("no docker".into()).into();
        assert_eq!(err.kind(), "build.local_engine_unavailable");

        let err: EngineError = TransferError::PathNotFound("/nope".into()).into();
        assert_eq!(engine_status(&err), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_session_fatal_only_for_disconnect() {
        assert!(EngineError::from(ExecError::Disconnected("eof".into())).is_session_fatal());
        assert!(!EngineError::from(ExecError::Cancelled).is_session_fatal());
    }
}
