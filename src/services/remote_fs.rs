//! 远程文件系统操作
//!
//! 基于远程 shell 实现；写入先落到同目录的临时文件，校验大小后重命名

use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::env::constants::DEPLOY_STEP_TIMEOUT_SECS;
use crate::domain::fs::{sort_entries, CommandOutput, RemoteEntry};
use crate::error::{EngineError, EngineResult, TransferError};
use crate::infra::shell_quote;
use crate::services::ssh::{ExecOptions, Session};

/// 远程脚本约定的退出码
const EXIT_NOT_FOUND: i32 = 2;
const EXIT_PERMISSION_DENIED: i32 = 3;
const EXIT_IS_DIRECTORY: i32 = 4;
const EXIT_SIZE_MISMATCH: i32 = 5;
const EXIT_NOT_DIRECTORY: i32 = 6;

/// 远程文件系统
pub struct RemoteFileSystem<'a> {
    session: &'a Session,
    cancel: CancellationToken,
    /// 上传、下载的超时
    transfer_timeout: Duration,
}

impl<'a> RemoteFileSystem<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            transfer_timeout: Duration::from_secs(DEPLOY_STEP_TIMEOUT_SECS),
        }
    }

    /// 绑定取消令牌（部署流水线使用）
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// 列出目录：目录在前，再按名称排序
    pub async fn list_directory(&self, path: &str) -> EngineResult<Vec<RemoteEntry>> {
        let p = shell_quote(path);
        let script = format!(
            "p={p}; \
             if [ ! -e \"$p\" ]; then echo \"no such file or directory\" >&2; exit {nf}; fi; \
             if [ ! -d \"$p\" ]; then echo \"not a directory\" >&2; exit {nd}; fi; \
             if [ ! -r \"$p\" ] || [ ! -x \"$p\" ]; then echo \"permission denied\" >&2; exit {pd}; fi; \
             find \"$p\" -mindepth 1 -maxdepth 1 -printf '%Y\\t%s\\t%T@\\t%f\\n'",
            p = p,
            nf = EXIT_NOT_FOUND,
            nd = EXIT_NOT_DIRECTORY,
            pd = EXIT_PERMISSION_DENIED,
        );

        let output = self.exec(&script, ExecOptions::new()).await?;
        check_exit(&output, path)?;

        let mut entries: Vec<RemoteEntry> = output
            .stdout
            .lines()
            .filter_map(RemoteEntry::parse_find_line)
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    /// 上传本地文件（流式）
    pub async fn upload(&self, local_path: &Path, remote_path: &str) -> EngineResult<u64> {
        let size = fs::metadata(local_path).await.map_err(TransferError::from)?.len();
        let file = fs::File::open(local_path).await.map_err(TransferError::from)?;

        self.atomic_write(remote_path, Box::new(file), size, None).await?;
        info!(
            local = %local_path.display(),
            remote = %remote_path,
            bytes = size,
            "Upload completed"
        );
        Ok(size)
    }

    /// 写入小文件（环境变量文件、生成的 compose 文件），可指定权限
    pub async fn write_file(&self, remote_path: &str, content: &[u8], mode: u32) -> EngineResult<()> {
        let reader = std::io::Cursor::new(content.to_vec());
        self.atomic_write(remote_path, Box::new(reader), content.len() as u64, Some(mode))
            .await?;
        debug!(remote = %remote_path, bytes = content.len(), mode = %format!("{:o}", mode), "File written");
        Ok(())
    }

    async fn atomic_write(
        &self,
        remote_path: &str,
        reader: crate::services::ssh::InputStream,
        size: u64,
        mode: Option<u32>,
    ) -> EngineResult<()> {
        let temp_path = temp_sibling(remote_path);
        let script = atomic_write_script(remote_path, &temp_path, size, mode);

        let result = self
            .exec(&script, ExecOptions::new().stdin(reader).timeout(self.transfer_timeout))
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.remove_quietly(&temp_path).await;
                return Err(e);
            }
        };

        if output.exit_code == EXIT_SIZE_MISMATCH {
            return Err(TransferError::PartialWrite {
                path: remote_path.to_string(),
                expected: size,
            }
            .into());
        }
        check_exit(&output, remote_path)
    }

    /// 下载远程文件（流式）
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> EngineResult<u64> {
        let p = shell_quote(remote_path);
        let stat_cmd = format!(
            "p={p}; \
             if [ ! -e \"$p\" ]; then echo \"no such file or directory\" >&2; exit {nf}; fi; \
             if [ -d \"$p\" ]; then echo \"is a directory\" >&2; exit {dir}; fi; \
             if [ ! -r \"$p\" ]; then echo \"permission denied\" >&2; exit {pd}; fi; \
             wc -c < \"$p\"",
            p = p,
            nf = EXIT_NOT_FOUND,
            dir = EXIT_IS_DIRECTORY,
            pd = EXIT_PERMISSION_DENIED,
        );
        let output = self.exec(&stat_cmd, ExecOptions::new()).await?;
        check_exit(&output, remote_path)?;
        let expected: u64 = output.stdout.trim().parse().map_err(|_| {
            EngineError::Remote(format!("unexpected size output: {}", output.stdout.trim()))
        })?;

        let temp_path = local_temp_sibling(local_path);
        let result = self.download_to(remote_path, &temp_path, expected).await;
        match result {
            Ok(()) => {
                fs::rename(&temp_path, local_path)
                    .await
                    .map_err(TransferError::from)?;
                info!(remote = %remote_path, local = %local_path.display(), bytes = expected, "Download completed");
                Ok(expected)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn download_to(&self, remote_path: &str, temp_path: &Path, expected: u64) -> EngineResult<()> {
        let file = fs::File::create(temp_path).await.map_err(TransferError::from)?;
        let output = self
            .exec(
                &format!("cat -- {}", shell_quote(remote_path)),
                ExecOptions::new()
                    .stdout(Box::new(file))
                    .timeout(self.transfer_timeout),
            )
            .await?;
        check_exit(&output, remote_path)?;

        let written = fs::metadata(temp_path).await.map_err(TransferError::from)?.len();
        if written != expected {
            warn!(remote = %remote_path, expected, written, "Download size mismatch");
            return Err(TransferError::PartialWrite {
                path: temp_path.display().to_string(),
                expected,
            }
            .into());
        }
        Ok(())
    }

    /// 删除单个文件，拒绝删除目录
    pub async fn delete(&self, remote_path: &str) -> EngineResult<()> {
        let p = shell_quote(remote_path);
        let script = format!(
            "p={p}; \
             if [ ! -e \"$p\" ] && [ ! -L \"$p\" ]; then echo \"no such file or directory\" >&2; exit {nf}; fi; \
             if [ -d \"$p\" ] && [ ! -L \"$p\" ]; then echo \"is a directory\" >&2; exit {dir}; fi; \
             rm -f -- \"$p\" || exit {pd}",
            p = p,
            nf = EXIT_NOT_FOUND,
            dir = EXIT_IS_DIRECTORY,
            pd = EXIT_PERMISSION_DENIED,
        );
        let output = self.exec(&script, ExecOptions::new()).await?;
        check_exit(&output, remote_path)?;
        info!(remote = %remote_path, "File deleted");
        Ok(())
    }

    /// 执行任意命令；非零退出码作为结果返回而不是错误
    pub async fn run_command(&self, command: &str, timeout: Option<Duration>) -> EngineResult<CommandOutput> {
        let mut options = ExecOptions::new();
        options.timeout = timeout;
        self.exec(command, options).await
    }

    /// 路径是否存在
    pub async fn exists(&self, remote_path: &str) -> EngineResult<bool> {
        let output = self
            .exec(&format!("[ -e {} ]", shell_quote(remote_path)), ExecOptions::new())
            .await?;
        Ok(output.success())
    }

    /// mkdir -p
    pub async fn ensure_directory(&self, remote_path: &str) -> EngineResult<()> {
        let output = self
            .exec(&format!("mkdir -p -- {}", shell_quote(remote_path)), ExecOptions::new())
            .await?;
        if output.success() {
            return Ok(());
        }
        if output.stderr.to_lowercase().contains("permission denied") {
            return Err(TransferError::PermissionDenied(remote_path.to_string()).into());
        }
        Err(EngineError::Remote(output.stderr.trim().to_string()))
    }

    async fn remove_quietly(&self, remote_path: &str) {
        let command = format!("rm -f -- {}", shell_quote(remote_path));
        if let Err(e) = self.session.run(&command).await {
            debug!(remote = %remote_path, error = %e, "Temporary file cleanup failed");
        }
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> EngineResult<CommandOutput> {
        let options = ExecOptions {
            cancel: Some(options.cancel.unwrap_or_else(|| self.cancel.clone())),
            ..options
        };
        Ok(self.session.exec(command, options).await?)
    }
}

/// 远程脚本退出码转换为传输错误
fn check_exit(output: &CommandOutput, path: &str) -> EngineResult<()> {
    match output.exit_code {
        0 => Ok(()),
        EXIT_NOT_FOUND => Err(TransferError::PathNotFound(path.to_string()).into()),
        EXIT_PERMISSION_DENIED => Err(TransferError::PermissionDenied(path.to_string()).into()),
        EXIT_IS_DIRECTORY => Err(TransferError::IsDirectory(path.to_string()).into()),
        EXIT_NOT_DIRECTORY => Err(EngineError::Remote(format!("{} is not a directory", path))),
        code => {
            let stderr = output.stderr.trim();
            if stderr.to_lowercase().contains("permission denied") {
                return Err(TransferError::PermissionDenied(path.to_string()).into());
            }
            Err(EngineError::Remote(format!("exit {}: {}", code, stderr)))
        }
    }
}

/// 远程临时文件：同目录下的 `<name>.part-<id>`
fn temp_sibling(remote_path: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}.part-{}", remote_path.trim_end_matches('/'), &id[..8])
}

fn local_temp_sibling(local_path: &Path) -> std::path::PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    local_path.with_file_name(format!("{}.part-{}", name, &id[..8]))
}

/// stdin 写入临时文件，大小一致后重命名；失败或被终止时删除临时文件
fn atomic_write_script(remote_path: &str, temp_path: &str, size: u64, mode: Option<u32>) -> String {
    let p = shell_quote(remote_path);
    let t = shell_quote(temp_path);
    let chmod = mode
        .map(|m| format!("chmod {:o} \"$t\" || exit {}; ", m, EXIT_PERMISSION_DENIED))
        .unwrap_or_default();

    format!(
        "p={p}; t={t}; d=$(dirname \"$p\"); \
         if [ ! -d \"$d\" ]; then echo \"no such directory: $d\" >&2; exit {nf}; fi; \
         if [ -d \"$p\" ]; then echo \"is a directory\" >&2; exit {dir}; fi; \
         if [ ! -w \"$d\" ]; then echo \"permission denied\" >&2; exit {pd}; fi; \
         trap 'rm -f \"$t\"' EXIT; trap 'exit 143' INT TERM; \
         (umask 077; cat > \"$t\") || exit {pd}; \
         s=$(wc -c < \"$t\" | tr -d ' '); \
         if [ \"$s\" != \"{size}\" ]; then echo \"expected {size} bytes, got $s\" >&2; exit {mismatch}; fi; \
         {chmod}mv -f \"$t\" \"$p\"",
        p = p,
        t = t,
        nf = EXIT_NOT_FOUND,
        dir = EXIT_IS_DIRECTORY,
        pd = EXIT_PERMISSION_DENIED,
        size = size,
        mismatch = EXIT_SIZE_MISMATCH,
        chmod = chmod,
    )
}
