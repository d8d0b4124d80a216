//! 镜像构建（Building 阶段）
//!
//! 远程构建直接在部署目录执行；本地构建后通过 `docker save | docker load` 传到远程

use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::context::{command_error, DeployContext};
use super::source::AcquiredSource;
use crate::error::{BuildError, EngineError, EngineResult};
use crate::infra::{shell_quote, CommandRunner};
use crate::services::containers::ComposeFlavor;
use crate::services::remote_fs::RemoteFileSystem;
use crate::services::ssh::{ExecOptions, Session};

/// 仓库中可识别的 compose 文件（按优先级）
pub const COMPOSE_FILE_CANDIDATES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// 本地 docker 探测超时
const LOCAL_ENGINE_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// 构建结果
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    /// 使用仓库自带的 compose 文件；为空时发布阶段生成 compose 文件
    pub compose_file: Option<String>,
}

/// 构建镜像
pub async fn build(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
    compose: &ComposeFlavor,
    source: &AcquiredSource,
) -> EngineResult<BuildOutcome> {
    match &source.local_dir {
        Some(dir) => {
            build_local(ctx, session, dir).await?;
            Ok(BuildOutcome { compose_file: None })
        }
        None => build_remote(ctx, session, fs, compose).await,
    }
}

/// 部署目录中的仓库 compose 文件
pub async fn find_compose_file(ctx: &DeployContext, session: &Session) -> EngineResult<Option<String>> {
    let command = format!(
        "cd {} && for f in {}; do if [ -f \"$f\" ]; then echo \"$f\"; break; fi; done",
        shell_quote(&ctx.remote_path()),
        COMPOSE_FILE_CANDIDATES.join(" ")
    );
    let output = session.run(&command).await?;
    let name = output.stdout.trim();
    Ok(COMPOSE_FILE_CANDIDATES
        .iter()
        .find(|candidate| **candidate == name)
        .map(|candidate| candidate.to_string()))
}

/// 远程构建：有 compose 文件用 compose build，否则 docker build
async fn build_remote(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
    compose: &ComposeFlavor,
) -> EngineResult<BuildOutcome> {
    let _guard = ctx.exclusive(session).await?;
    let path = ctx.remote_path();
    let p = shell_quote(&path);

    let compose_file = find_compose_file(ctx, session).await?;
    let command = match &compose_file {
        Some(file) => {
            ctx.log_system(format!("Building with {}", file)).await;
            format!(
                "cd {} && {} -p {} -f {} build",
                p,
                compose.command(&ctx.config.docker_bin),
                shell_quote(&ctx.project),
                shell_quote(file)
            )
        }
        None if fs.exists(&format!("{}/Dockerfile", path)).await? => {
            ctx.log_system("Building with Dockerfile").await;
            format!(
                "cd {} && {} build -t {} .",
                p,
                ctx.config.docker_bin,
                shell_quote(&ctx.image())
            )
        }
        None => {
            return Err(BuildError::BuildCommandFailed(format!(
                "no compose file or Dockerfile found in {}",
                path
            ))
            .into())
        }
    };

    let output = ctx.remote(session, &command).await?;
    if !output.success() {
        return Err(BuildError::BuildCommandFailed(format!(
            "remote build exited with code {}",
            output.exit_code
        ))
        .into());
    }

    info!(run_id = %ctx.run_id, project = %ctx.project, "Remote build finished");
    Ok(BuildOutcome { compose_file })
}

/// 本地构建并传输镜像
async fn build_local(ctx: &DeployContext, session: &Session, context_dir: &Path) -> EngineResult<()> {
    let docker = ctx.config.local_docker_bin.as_str();
    ensure_local_engine(docker, context_dir).await?;

    let image = ctx.image();
    let context = context_dir.to_string_lossy().into_owned();
    ctx.log_system(format!(">>> {} build -t {} {}", docker, image, context))
        .await;
    let status = CommandRunner::run_with_streaming(
        docker,
        &["build", "-t", &image, &context],
        context_dir,
        &ctx.sink,
        &ctx.cancel_token,
        ctx.config.step_timeout,
    )
    .await
    .map_err(|e| {
        if e.is_not_found() {
            EngineError::from(BuildError::LocalEngineUnavailable(e.to_string()))
        } else {
            command_error(e)
        }
    })?;
    if !status.success() {
        return Err(BuildError::BuildCommandFailed(format!("local docker build failed ({})", status)).into());
    }
    ctx.check_cancelled()?;

    let transfer = transfer_image(ctx, session, docker, &image, context_dir).await;

    if !ctx.app.keep_local_images {
        match CommandRunner::run_simple(docker, &["rmi", &image], context_dir, LOCAL_ENGINE_CHECK_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                ctx.log_system(format!("Removed local image {}", image)).await;
            }
            Ok(output) => warn!(
                image = %image,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to remove local image"
            ),
            Err(e) => warn!(image = %image, error = %e, "Failed to remove local image"),
        }
    }

    transfer
}

/// 确认本地 docker 可用
async fn ensure_local_engine(docker: &str, work_dir: &Path) -> EngineResult<()> {
    let output = CommandRunner::run_simple(
        docker,
        &["version", "--format", "{{.Server.Version}}"],
        work_dir,
        LOCAL_ENGINE_CHECK_TIMEOUT,
    )
    .await
    .map_err(|e| BuildError::LocalEngineUnavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(BuildError::LocalEngineUnavailable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        )
        .into());
    }
    Ok(())
}

/// `docker save` 的输出直接作为远程 `docker load` 的标准输入
async fn transfer_image(
    ctx: &DeployContext,
    session: &Session,
    docker: &str,
    image: &str,
    work_dir: &Path,
) -> EngineResult<()> {
    ctx.log_system(format!(">>> {} save {} | ssh {} load", docker, image, ctx.config.docker_bin))
        .await;
    let mut child = CommandRunner::spawn_piped(docker, &["save", image], work_dir, &ctx.sink)
        .map_err(|e| BuildError::LocalEngineUnavailable(e.to_string()))?;
    let Some(stdout) = child.stdout.take() else {
        return Err(BuildError::BuildCommandFailed("docker save produced no output stream".to_string()).into());
    };

    let loaded = session
        .exec(
            &format!("{} load", ctx.config.docker_bin),
            ExecOptions::new()
                .stdin(Box::new(stdout))
                .timeout(ctx.config.step_timeout)
                .cancel(ctx.cancel_token.clone())
                .sink(ctx.sink.clone()),
        )
        .await;

    let loaded = match loaded {
        Ok(output) => output,
        Err(e) => {
            let _ = child.kill().await;
            return Err(e.into());
        }
    };
    let saved = child
        .wait()
        .await
        .map_err(|e| BuildError::BuildCommandFailed(format!("docker save failed: {}", e)))?;

    if !saved.success() {
        return Err(BuildError::BuildCommandFailed(format!("docker save failed ({})", saved)).into());
    }
    if !loaded.success() {
        return Err(BuildError::BuildCommandFailed(format!(
            "remote docker load exited with code {}",
            loaded.exit_code
        ))
        .into());
    }

    info!(run_id = %ctx.run_id, image = %image, "Image transferred to remote host");
    Ok(())
}
