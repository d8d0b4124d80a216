//! 命令边界
//!
//! 控制端发送 `{"command": "...", "params": {...}}`，返回 `{"type": "...", "data": ...}`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::app::{ApplicationConfig, Environment};
use super::container::{ContainerSnapshot, ImageSnapshot, LifecycleAction, ReverseProxyInfo};
use super::deploy::{DeploymentRun, TargetStatus};
use super::fs::{CommandOutput, RemoteEntry};
use super::profile::{ConnectionInfo, ConnectionProfile, GeneratedKey, LocalKey, RedactedProfile};

/// 控制端命令
#[derive(Debug, Deserialize)]
#[serde(tag = "command", content = "params")]
pub enum Command {
    /// 测试连接；未提供 profile 时使用已保存的配置
    #[serde(rename = "connection.test")]
    ConnectionTest {
        #[serde(default)]
        profile: Option<ConnectionProfile>,
    },
    #[serde(rename = "connection.save")]
    ConnectionSave { profile: ConnectionProfile },
    #[serde(rename = "connection.detectKeys")]
    ConnectionDetectKeys,
    #[serde(rename = "connection.generateKey")]
    ConnectionGenerateKey {
        #[serde(default)]
        comment: String,
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        force: bool,
    },

    #[serde(rename = "app.save")]
    AppSave { config: ApplicationConfig },
    #[serde(rename = "app.delete")]
    AppDelete { app_id: String },
    #[serde(rename = "app.list")]
    AppList,

    #[serde(rename = "deploy.start")]
    DeployStart {
        app_id: String,
        environment: Environment,
    },
    #[serde(rename = "deploy.status")]
    DeployStatus {
        app_id: String,
        environment: Environment,
    },
    #[serde(rename = "deploy.cancel")]
    DeployCancel {
        app_id: String,
        environment: Environment,
    },
    #[serde(rename = "deploy.history")]
    DeployHistory {
        #[serde(default = "default_history_limit")]
        limit: usize,
        #[serde(default)]
        app_id: Option<String>,
    },

    #[serde(rename = "containers.list")]
    ContainersList,
    #[serde(rename = "images.list")]
    ImagesList,
    #[serde(rename = "containers.lifecycle")]
    ContainersLifecycle {
        id: String,
        action: LifecycleAction,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename = "containers.logs")]
    ContainersLogs {
        id: String,
        #[serde(default = "default_log_tail")]
        tail: usize,
    },
    #[serde(rename = "images.remove")]
    ImagesRemove { id: String },

    #[serde(rename = "fs.list")]
    FsList { path: String },
    #[serde(rename = "fs.upload")]
    FsUpload {
        local_path: PathBuf,
        remote_path: String,
    },
    #[serde(rename = "fs.download")]
    FsDownload {
        remote_path: String,
        local_path: PathBuf,
    },
    #[serde(rename = "fs.delete")]
    FsDelete { path: String },
    #[serde(rename = "fs.run")]
    FsRun {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },

    #[serde(rename = "proxy.detect")]
    ProxyDetect,
}

fn default_history_limit() -> usize {
    20
}

fn default_log_tail() -> usize {
    100
}

impl Command {
    /// 命令名（与线上格式一致）
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConnectionTest { .. } => "connection.test",
            Command::ConnectionSave { .. } => "connection.save",
            Command::ConnectionDetectKeys => "connection.detectKeys",
            Command::ConnectionGenerateKey { .. } => "connection.generateKey",
            Command::AppSave { .. } => "app.save",
            Command::AppDelete { .. } => "app.delete",
            Command::AppList => "app.list",
            Command::DeployStart { .. } => "deploy.start",
            Command::DeployStatus { .. } => "deploy.status",
            Command::DeployCancel { .. } => "deploy.cancel",
            Command::DeployHistory { .. } => "deploy.history",
            Command::ContainersList => "containers.list",
            Command::ImagesList => "images.list",
            Command::ContainersLifecycle { .. } => "containers.lifecycle",
            Command::ContainersLogs { .. } => "containers.logs",
            Command::ImagesRemove { .. } => "images.remove",
            Command::FsList { .. } => "fs.list",
            Command::FsUpload { .. } => "fs.upload",
            Command::FsDownload { .. } => "fs.download",
            Command::FsDelete { .. } => "fs.delete",
            Command::FsRun { .. } => "fs.run",
            Command::ProxyDetect => "proxy.detect",
        }
    }

    /// 是否需要远程会话
    pub fn needs_session(&self) -> bool {
        matches!(
            self,
            Command::ContainersList
                | Command::ImagesList
                | Command::ContainersLifecycle { .. }
                | Command::ContainersLogs { .. }
                | Command::ImagesRemove { .. }
                | Command::FsList { .. }
                | Command::FsUpload { .. }
                | Command::FsDownload { .. }
                | Command::FsDelete { .. }
                | Command::FsRun { .. }
                | Command::ProxyDetect
        )
    }
}

/// 命令结果
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandOutcome {
    Connection(ConnectionInfo),
    Profile(RedactedProfile),
    Keys(Vec<LocalKey>),
    GeneratedKey(GeneratedKey),
    App(ApplicationConfig),
    Apps(Vec<ApplicationConfig>),
    Deleted { existed: bool },
    Run(DeploymentRun),
    Status(TargetStatus),
    Cancelled { cancelled: bool },
    Runs(Vec<DeploymentRun>),
    Containers(Vec<ContainerSnapshot>),
    Images(Vec<ImageSnapshot>),
    Logs(Vec<String>),
    Entries(Vec<RemoteEntry>),
    Transferred { bytes: u64 },
    Output(CommandOutput),
    Proxy(ReverseProxyInfo),
    Done,
}
