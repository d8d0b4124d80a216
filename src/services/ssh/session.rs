//! 远程会话
//!
//! 包装一条 SSH 连接：命令超时、取消与远程进程组终止、输出收集

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{ExecEvent, ExecOptions, OutputStream, RemoteShell};
use crate::domain::fs::CommandOutput;
use crate::error::ExecError;
use crate::infra::shell_quote;
use crate::state::stream_hub::StreamSink;

/// 远程进程在 stderr 第一行报告自己的 PID
const PID_MARKER: &str = "__REMOTE_PID=";

/// 单个输出缓冲最多保留的字节数（超出时保留尾部）
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

const EXEC_EVENT_BUFFER: usize = 64;

/// 终止远程进程组的超时
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

struct SessionInner {
    id: String,
    fingerprint: String,
    target: String,
    shell: Arc<dyn RemoteShell>,
    /// 多命令逻辑操作的互斥锁
    op_lock: Arc<AsyncMutex<()>>,
    last_used: Mutex<Instant>,
    /// 进行中的命令与逻辑操作数
    in_flight: AtomicUsize,
    default_timeout: Duration,
    broken: AtomicBool,
}

/// 会话使用租约，存在期间会话不会被当作空闲回收
pub struct SessionLease {
    inner: Arc<SessionInner>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut last_used) = self.inner.last_used.lock() {
            *last_used = Instant::now();
        }
    }
}

/// 操作锁，同时持有租约
pub struct ExclusiveGuard {
    _lock: OwnedMutexGuard<()>,
    _lease: SessionLease,
}

/// 远程会话（可克隆，共享同一连接）
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        fingerprint: impl Into<String>,
        target: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                fingerprint: fingerprint.into(),
                target: target.into(),
                shell,
                op_lock: Arc::new(AsyncMutex::new(())),
                last_used: Mutex::new(Instant::now()),
                in_flight: AtomicUsize::new(0),
                default_timeout,
                broken: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// user@host:port
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.broken.load(Ordering::Relaxed) || self.inner.shell.is_closed()
    }

    /// 距上次使用的时长
    pub fn idle_for(&self) -> Duration {
        self.inner
            .last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn touch(&self) {
        if let Ok(mut last_used) = self.inner.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    /// 标记会话正在使用
    pub fn lease(&self) -> SessionLease {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        SessionLease {
            inner: self.inner.clone(),
        }
    }

    /// 是否有进行中的命令或操作
    pub fn is_busy(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    /// 获取操作锁
    ///
    /// 多条命令组成的逻辑操作（clone 后 checkout、写环境后 up）持有该锁，
    /// 只读查询不需要
    pub async fn exclusive(&self) -> ExclusiveGuard {
        let lease = self.lease();
        ExclusiveGuard {
            _lock: self.inner.op_lock.clone().lock_owned().await,
            _lease: lease,
        }
    }

    pub async fn close(&self) {
        self.inner.broken.store(true, Ordering::Relaxed);
        self.inner.shell.close().await;
    }

    /// 使用默认选项执行命令
    pub async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.exec(command, ExecOptions::default()).await
    }

    /// 执行远程命令
    ///
    /// 超时或取消时通过另一条 channel 向远程进程组发送 TERM，
    /// 然后关闭当前 channel
    pub async fn exec(&self, command: &str, options: ExecOptions) -> Result<CommandOutput, ExecError> {
        let ExecOptions {
            timeout,
            cancel,
            stdin,
            stdout,
            sink,
        } = options;
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let cancel = cancel.unwrap_or_default();
        let _lease = self.lease();

        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let wrapped = wrap_command(command);
        let mut collector = OutputCollector::new(sink, stdout);

        let outcome = {
            let (tx, mut rx) = mpsc::channel(EXEC_EVENT_BUFFER);
            let exec = self.inner.shell.exec(&wrapped, stdin, tx);
            tokio::pin!(exec);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(ExecError::Cancelled),
                    _ = &mut deadline => break Err(ExecError::Timeout(timeout)),
                    Some(event) = rx.recv() => {
                        self.touch();
                        if let Err(e) = collector.handle(event).await {
                            break Err(e);
                        }
                    }
                    result = &mut exec => {
                        let mut drained = Ok(());
                        while let Ok(event) = rx.try_recv() {
                            drained = collector.handle(event).await;
                            if drained.is_err() {
                                break;
                            }
                        }
                        break drained.and(result);
                    }
                }
            }
        };

        match outcome {
            Ok(exit_code) => {
                let (stdout, stderr) = collector.finish().await?;
                debug!(
                    target = %self.inner.target,
                    exit_code,
                    "Remote command finished"
                );
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Err(e @ (ExecError::Cancelled | ExecError::Timeout(_) | ExecError::Io(_))) => {
                warn!(target = %self.inner.target, error = %e, "Remote command interrupted");
                if let Some(pid) = collector.pid {
                    self.kill_process_group(pid).await;
                }
                Err(e)
            }
            Err(e) => {
                if e.is_session_fatal() {
                    self.inner.broken.store(true, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// 通过新 channel 终止远程进程组
    async fn kill_process_group(&self, pid: u32) {
        let command = format!(
            "kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid} 2>/dev/null; true",
            pid = pid
        );
        let (tx, _rx) = mpsc::channel(EXEC_EVENT_BUFFER);
        match tokio::time::timeout(KILL_TIMEOUT, self.inner.shell.exec(&command, None, tx)).await {
            Ok(Ok(_)) => debug!(target = %self.inner.target, pid, "Remote process group terminated"),
            Ok(Err(e)) => warn!(target = %self.inner.target, pid, error = %e, "Failed to terminate remote process"),
            Err(_) => warn!(target = %self.inner.target, pid, "Timed out terminating remote process"),
        }
    }
}

/// 包装命令：先在 stderr 报告 PID，再 exec 到目标命令（PID 与进程组不变）
fn wrap_command(command: &str) -> String {
    let inner = format!(
        "printf '{}%s\\n' \"$$\" >&2; exec sh -c {}",
        PID_MARKER,
        shell_quote(command)
    );
    format!("exec sh -c {}", shell_quote(&inner))
}

/// 解析 PID 标记行
fn parse_pid_marker(line: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(line).ok()?;
    line.trim_end_matches('\r')
        .strip_prefix(PID_MARKER)?
        .trim()
        .parse()
        .ok()
}

/// 追加并限制缓冲大小，超出时丢弃头部
fn append_capped(buffer: &mut Vec<u8>, data: &[u8]) {
    buffer.extend_from_slice(data);
    if buffer.len() > MAX_CAPTURE_BYTES {
        let excess = buffer.len() - MAX_CAPTURE_BYTES;
        buffer.drain(..excess);
    }
}

/// 输出收集器
struct OutputCollector {
    sink: Option<StreamSink>,
    writer: Option<OutputStream>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_partial: Vec<u8>,
    stderr_partial: Vec<u8>,
    pid: Option<u32>,
    marker_checked: bool,
}

impl OutputCollector {
    fn new(sink: Option<StreamSink>, writer: Option<OutputStream>) -> Self {
        Self {
            sink,
            writer,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_partial: Vec::new(),
            stderr_partial: Vec::new(),
            pid: None,
            marker_checked: false,
        }
    }

    async fn handle(&mut self, event: ExecEvent) -> Result<(), ExecError> {
        match event {
            ExecEvent::Stdout(data) => {
                if let Some(writer) = self.writer.as_mut() {
                    writer
                        .write_all(&data)
                        .await
                        .map_err(|e| ExecError::Io(e.to_string()))?;
                    return Ok(());
                }
                append_capped(&mut self.stdout, &data);
                if let Some(sink) = &self.sink {
                    self.stdout_partial.extend_from_slice(&data);
                    for line in take_lines(&mut self.stdout_partial) {
                        sink.stdout(String::from_utf8_lossy(&line).into_owned()).await;
                    }
                }
            }
            ExecEvent::Stderr(data) => {
                self.stderr_partial.extend_from_slice(&data);
                for line in take_lines(&mut self.stderr_partial) {
                    self.stderr_line(line).await;
                }
            }
        }
        Ok(())
    }

    async fn stderr_line(&mut self, line: Vec<u8>) {
        if !self.marker_checked {
            self.marker_checked = true;
            if let Some(pid) = parse_pid_marker(&line) {
                self.pid = Some(pid);
                return;
            }
        }
        append_capped(&mut self.stderr, &line);
        append_capped(&mut self.stderr, b"\n");
        if let Some(sink) = &self.sink {
            sink.stderr(String::from_utf8_lossy(&line).into_owned()).await;
        }
    }

    /// 刷新未结束的行，返回 (stdout, stderr)
    async fn finish(mut self) -> Result<(String, String), ExecError> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .await
                .map_err(|e| ExecError::Io(e.to_string()))?;
        }
        if !self.stdout_partial.is_empty() {
            let rest = std::mem::take(&mut self.stdout_partial);
            if let Some(sink) = &self.sink {
                sink.stdout(String::from_utf8_lossy(&rest).into_owned()).await;
            }
        }
        if !self.stderr_partial.is_empty() {
            let rest = std::mem::take(&mut self.stderr_partial);
            self.stderr_line(rest).await;
        }
        Ok((
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        ))
    }
}

/// 取出缓冲中所有完整的行（不含换行符）
fn take_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}
