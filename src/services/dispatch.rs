//! 命令分发
//!
//! 每条命令执行时从存储读取连接配置并显式传给会话管理，不存在全局的"当前连接"

use std::time::Duration;
use tracing::{debug, info};

use crate::domain::command::{Command, CommandOutcome};
use crate::error::{ConcurrencyError, EngineError, EngineResult};
use crate::services::containers::ContainerRegistry;
use crate::services::remote_fs::RemoteFileSystem;
use crate::services::ssh::{detect_local_keys, generate_key_pair, Session};
use crate::state::AppState;

/// 执行一条命令
pub async fn dispatch(state: &AppState, command: Command) -> EngineResult<CommandOutcome> {
    debug!(command = command.name(), remote = command.needs_session(), "Dispatching command");

    match command {
        Command::ConnectionTest { profile } => {
            let profile = match profile {
                Some(profile) => profile,
                None => state.store.require_profile().await?,
            };
            let info = state.connections.test(&profile).await?;
            Ok(CommandOutcome::Connection(info))
        }
        Command::ConnectionSave { profile } => {
            // 替换配置时断开旧会话；有部署在运行时拒绝替换
            if let Some(previous) = state.store.profile().await {
                if previous.fingerprint() != profile.fingerprint() {
                    if let Some(run) = state.runs.active_runs().await.into_iter().next() {
                        return Err(ConcurrencyError::DeploymentAlreadyInProgress(format!(
                            "{}/{}",
                            run.app_id, run.environment
                        ))
                        .into());
                    }
                    state.connections.disconnect(&previous).await;
                }
            }
            let redacted = profile.redacted();
            state.store.save_profile(profile).await?;
            Ok(CommandOutcome::Profile(redacted))
        }
        Command::ConnectionDetectKeys => {
            let keys = match &state.ssh_dir {
                Some(dir) => detect_local_keys(dir).await,
                None => Vec::new(),
            };
            Ok(CommandOutcome::Keys(keys))
        }
        Command::ConnectionGenerateKey { comment, path, force } => {
            let generated = generate_key_pair(state.ssh_dir.as_deref(), &comment, path, force).await?;
            info!(path = %generated.private_key_path.display(), "SSH key pair generated");
            Ok(CommandOutcome::GeneratedKey(generated))
        }

        Command::AppSave { config } => Ok(CommandOutcome::App(state.store.save_application(config).await?)),
        Command::AppDelete { app_id } => {
            if state.runs.has_active_for_app(&app_id).await {
                return Err(ConcurrencyError::DeploymentAlreadyInProgress(app_id).into());
            }
            let existed = state.store.delete_application(&app_id).await?;
            Ok(CommandOutcome::Deleted { existed })
        }
        Command::AppList => Ok(CommandOutcome::Apps(state.store.applications().await)),

        Command::DeployStart { app_id, environment } => {
            let app = state.store.require_application(&app_id).await?;
            let profile = state.store.require_profile().await?;
            let run = state.orchestrator.start(profile, app, environment).await?;
            Ok(CommandOutcome::Run(run))
        }
        Command::DeployStatus { app_id, environment } => Ok(CommandOutcome::Status(
            state.orchestrator.status(&app_id, environment).await,
        )),
        Command::DeployCancel { app_id, environment } => Ok(CommandOutcome::Cancelled {
            cancelled: state.orchestrator.cancel(&app_id, environment).await,
        }),
        Command::DeployHistory { limit, app_id } => Ok(CommandOutcome::Runs(
            state.orchestrator.history(limit, app_id.as_deref()).await,
        )),

        remote => {
            let profile = state.store.require_profile().await?;
            let docker = state.config.deploy.docker_bin.clone();
            let transfer_timeout = state.config.deploy.step_timeout;
            state
                .connections
                .with_session(&profile, move |session| async move {
                    run_remote(&session, &docker, transfer_timeout, remote).await
                })
                .await
        }
    }
}

/// 在会话上执行容器与文件命令
async fn run_remote(
    session: &Session,
    docker: &str,
    transfer_timeout: Duration,
    command: Command,
) -> EngineResult<CommandOutcome> {
    let fs = RemoteFileSystem::new(session).with_transfer_timeout(transfer_timeout);
    let registry = ContainerRegistry::new(session, docker);

    let outcome = match command {
        Command::ContainersList => CommandOutcome::Containers(registry.list_containers().await?),
        Command::ImagesList => CommandOutcome::Images(registry.list_images().await?),
        Command::ContainersLifecycle { id, action, force } => {
            registry.lifecycle(&id, action, force).await?;
            info!(container = %id, action = action.as_str(), force, "Container lifecycle command done");
            CommandOutcome::Done
        }
        Command::ContainersLogs { id, tail } => CommandOutcome::Logs(registry.container_logs(&id, tail).await?),
        Command::ImagesRemove { id } => {
            registry.remove_image(&id).await?;
            info!(image = %id, "Image removed");
            CommandOutcome::Done
        }
        Command::FsList { path } => CommandOutcome::Entries(fs.list_directory(&path).await?),
        Command::FsUpload { local_path, remote_path } => CommandOutcome::Transferred {
            bytes: fs.upload(&local_path, &remote_path).await?,
        },
        Command::FsDownload { remote_path, local_path } => CommandOutcome::Transferred {
            bytes: fs.download(&remote_path, &local_path).await?,
        },
        Command::FsDelete { path } => {
            fs.delete(&path).await?;
            CommandOutcome::Done
        }
        Command::FsRun { command, timeout_secs } => CommandOutcome::Output(
            fs.run_command(&command, timeout_secs.map(Duration::from_secs)).await?,
        ),
        Command::ProxyDetect => CommandOutcome::Proxy(registry.detect_reverse_proxy().await?),
        other => {
            return Err(EngineError::Remote(format!(
                "{} is not a remote command",
                other.name()
            )))
        }
    };
    Ok(outcome)
}
