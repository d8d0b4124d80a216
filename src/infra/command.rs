//! 本地命令执行器
//!
//! 本地构建（git clone、docker build/save）使用，支持：
//! - 实时输出发布到输出流
//! - 超时控制
//! - 取消支持
//! - stdout/stderr 分离

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::state::stream_hub::StreamSink;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 命令超时
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// 命令被取消
    #[error("command was cancelled")]
    Cancelled,
    /// 等待命令完成失败
    #[error("failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
}

impl CommandError {
    /// 程序不存在（如本机未安装 docker）
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandError::SpawnFailed { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl CommandRunner {
    /// 执行命令并流式输出
    ///
    /// 超时与取消都会杀掉子进程
    pub async fn run_with_streaming(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        sink: &StreamSink,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<ExitStatus, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.stdout(line).await;
                }
            })
        });

        let stderr_task = Self::forward_stderr(&mut child, sink);

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(CommandError::Timeout(timeout))
            }
            status = child.wait() => status.map_err(CommandError::WaitFailed),
        };

        // 等待输出读取完成
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        result
    }

    /// 启动命令，stdout 交给调用方读取（如 `docker save` 的镜像流）
    ///
    /// stderr 逐行发布到输出流
    pub fn spawn_piped(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        sink: &StreamSink,
    ) -> Result<Child, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let _ = Self::forward_stderr(&mut child, sink);
        Ok(child)
    }

    fn forward_stderr(child: &mut Child, sink: &StreamSink) -> Option<tokio::task::JoinHandle<()>> {
        child.stderr.take().map(|stderr| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.stderr(line).await;
                }
            })
        })
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于探测类命令（如 `docker version`）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(|source| CommandError::SpawnFailed {
                    program: program.to_string(),
                    source,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout(timeout))
            }
        }
    }
}

/// POSIX shell 单引号转义
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '=' | '@' | '+' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::stream_hub::{StreamEvent, StreamHub};
    use std::path::PathBuf;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(&result, Err(e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_streaming_publishes_lines() {
        let hub = Arc::new(StreamHub::new());
        let sink = StreamSink::new(hub.clone(), "local");
        let mut sub = hub.subscribe("local").await;

        let status = CommandRunner::run_with_streaming(
            "sh",
            &["-c", "echo out; echo err >&2"],
            &PathBuf::from("/tmp"),
            &sink,
            &CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(status.success());

        let mut lines = Vec::new();
        for _ in 0..2 {
            if let Some(StreamEvent::Chunk(chunk)) = sub.next().await {
                lines.push(chunk.content);
            }
        }
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn test_streaming_cancel_kills_process() {
        let hub = Arc::new(StreamHub::new());
        let sink = StreamSink::new(hub, "local");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = CommandRunner::run_with_streaming(
            "sleep",
            &["30"],
            &PathBuf::from("/tmp"),
            &sink,
            &cancel,
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/root/app-dev"), "/root/app-dev");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }
}
