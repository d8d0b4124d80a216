//! 源码获取（Acquiring 阶段）

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

use super::context::{command_error, DeployContext};
use super::package::package_directory;
use crate::domain::app::{BuildLocation, Source};
use crate::error::{EngineError, EngineResult, TransferError};
use crate::infra::{shell_quote, CommandRunner};
use crate::services::remote_fs::RemoteFileSystem;
use crate::services::ssh::Session;

/// 获取到的源码
pub struct AcquiredSource {
    /// 本地构建使用的目录
    pub local_dir: Option<PathBuf>,
    /// 解析出的提交
    pub commit: Option<String>,
    /// 临时工作目录，随运行结束删除
    _workspace: Option<TempDir>,
}

/// 按来源与构建位置获取源码
pub async fn acquire(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
) -> EngineResult<AcquiredSource> {
    match (&ctx.app.source, ctx.app.build_location) {
        (Source::GitRepository { url }, BuildLocation::Remote) => {
            let commit = sync_remote_checkout(ctx, session, fs, url).await?;
            Ok(AcquiredSource {
                local_dir: None,
                commit: Some(commit),
                _workspace: None,
            })
        }
        (Source::GitRepository { url }, BuildLocation::Local) => {
            let workspace = TempDir::new().map_err(TransferError::from)?;
            let checkout = workspace.path().join("src");
            let commit = shallow_clone(ctx, url, &checkout).await?;
            fs.ensure_directory(&ctx.remote_path()).await?;
            Ok(AcquiredSource {
                local_dir: Some(checkout),
                commit: Some(commit),
                _workspace: Some(workspace),
            })
        }
        (Source::LocalDirectory { path }, location) => {
            upload_directory(ctx, session, fs, path).await?;
            Ok(AcquiredSource {
                local_dir: (location == BuildLocation::Local).then(|| path.clone()),
                commit: None,
                _workspace: None,
            })
        }
    }
}

/// 远程仓库同步到分支最新提交：已有仓库 fetch + checkout -B + reset，否则 clone
async fn sync_remote_checkout(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
    url: &str,
) -> EngineResult<String> {
    let _guard = ctx.exclusive(session).await?;
    let path = ctx.remote_path();
    let branch = ctx.branch();
    let p = shell_quote(&path);
    let b = shell_quote(&branch);

    if fs.exists(&format!("{}/.git", path)).await? {
        ctx.log_system(format!("Updating existing checkout in {} ({})", path, branch))
            .await;
        let command = format!(
            "cd {p} && git remote set-url origin {u} && git fetch --prune origin {b} && git checkout -f -B {b} origin/{b} && git reset --hard origin/{b}",
            p = p,
            u = shell_quote(url),
            b = b,
        );
        let output = ctx.remote(session, &command).await?;
        if !output.success() {
            return Err(EngineError::Remote(format!(
                "git fetch of branch {} failed (exit {})",
                branch, output.exit_code
            )));
        }
    } else {
        ctx.log_system(format!("Cloning {} ({}) into {}", url, branch, path)).await;
        let parent = Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let command = format!(
            "mkdir -p {parent} && git clone --branch {b} --single-branch {u} {p}",
            parent = shell_quote(&parent),
            b = b,
            u = shell_quote(url),
            p = p,
        );
        let output = ctx.remote(session, &command).await?;
        if !output.success() {
            return Err(EngineError::Remote(format!(
                "git clone of branch {} failed (exit {})",
                branch, output.exit_code
            )));
        }
    }

    let output = ctx
        .remote(session, &format!("git -C {} rev-parse HEAD", p))
        .await?;
    let commit = output.stdout.trim().to_string();
    if !output.success() || commit.is_empty() {
        return Err(EngineError::Remote("cannot resolve checked out commit".to_string()));
    }

    ctx.set_commit(&commit).await;
    ctx.log_system(format!("Checked out {} at {}", branch, commit)).await;
    info!(run_id = %ctx.run_id, branch = %branch, commit = %commit, "Remote checkout updated");
    Ok(commit)
}

/// 本地浅克隆分支
async fn shallow_clone(ctx: &DeployContext, url: &str, dest: &Path) -> EngineResult<String> {
    let branch = ctx.branch();
    let dest_str = dest.to_string_lossy().into_owned();
    let work_dir = dest.parent().unwrap_or(dest);

    ctx.log_system(format!(">>> git clone --depth 1 --branch {} {}", branch, url))
        .await;
    let status = CommandRunner::run_with_streaming(
        "git",
        &["clone", "--depth", "1", "--branch", &branch, url, &dest_str],
        work_dir,
        &ctx.sink,
        &ctx.cancel_token,
        ctx.config.step_timeout,
    )
    .await
    .map_err(command_error)?;
    if !status.success() {
        return Err(EngineError::Remote(format!(
            "local git clone of branch {} failed ({})",
            branch, status
        )));
    }

    let output = CommandRunner::run_simple("git", &["rev-parse", "HEAD"], dest, ctx.config.step_timeout)
        .await
        .map_err(command_error)?;
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if commit.is_empty() {
        return Err(EngineError::Remote("cannot resolve cloned commit".to_string()));
    }

    ctx.set_commit(&commit).await;
    ctx.log_system(format!("Cloned {} at {}", branch, commit)).await;
    Ok(commit)
}

/// 打包本地目录，上传并解压到远程目录（覆盖同名文件）
async fn upload_directory(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
    source: &Path,
) -> EngineResult<()> {
    let workspace = TempDir::new().map_err(TransferError::from)?;
    let archive = workspace.path().join("source.tar.gz");

    ctx.log_system(format!("Packaging {}", source.display())).await;
    let summary = {
        let source = source.to_path_buf();
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || package_directory(&source, &archive))
            .await
            .map_err(|e| EngineError::Remote(format!("packaging task failed: {}", e)))?
            .map_err(TransferError::from)?
    };
    ctx.log_system(format!(
        "Packaged {} files ({} bytes before compression)",
        summary.files, summary.bytes
    ))
    .await;
    ctx.check_cancelled()?;

    let _guard = ctx.exclusive(session).await?;
    let path = ctx.remote_path();
    let remote_archive = format!("{}.upload-{}.tar.gz", path, short_id(&ctx.run_id));

    let size = fs.upload(&archive, &remote_archive).await?;
    ctx.log_system(format!("Uploaded {} bytes to {}", size, remote_archive)).await;

    let command = format!(
        "mkdir -p {p} && tar -xzf {a} -C {p}; rc=$?; rm -f {a}; exit $rc",
        p = shell_quote(&path),
        a = shell_quote(&remote_archive),
    );
    let output = ctx.remote(session, &command).await?;
    if !output.success() {
        return Err(EngineError::Remote(format!(
            "extracting source archive failed (exit {})",
            output.exit_code
        )));
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
