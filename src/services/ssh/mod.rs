//! SSH 客户端模块
//!
//! 连接远程主机、复用会话、执行远程命令

mod client;
mod keys;
mod pool;
mod session;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::profile::ConnectionProfile;
use crate::error::{ConnectError, ExecError};
use crate::state::stream_hub::StreamSink;

pub use client::RusshConnector;
pub use keys::{default_ssh_dir, detect_local_keys, generate_key_pair};
pub use pool::ConnectionManager;
pub use session::{ExclusiveGuard, Session, SessionLease};

/// 远程命令的标准输入
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// 远程命令标准输出的写入目标
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// 远程命令输出事件
#[derive(Debug)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// 一条已认证的 SSH 连接
///
/// 每次 exec 打开一个新 channel，同一连接上的 exec 可以并发
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// 执行命令，输出通过 `events` 推送，返回退出码
    async fn exec(
        &self,
        command: &str,
        stdin: Option<InputStream>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Result<i32, ExecError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// 建立 SSH 连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Arc<dyn RemoteShell>, ConnectError>;
}

/// 单次远程命令的执行选项
#[derive(Default)]
pub struct ExecOptions {
    /// 超时；为空时使用会话默认值
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub stdin: Option<InputStream>,
    /// 标准输出直接写入，不再缓存
    pub stdout: Option<OutputStream>,
    /// 逐行发布到输出流
    pub sink: Option<StreamSink>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn stdin(mut self, reader: InputStream) -> Self {
        self.stdin = Some(reader);
        self
    }

    pub fn stdout(mut self, writer: OutputStream) -> Self {
        self.stdout = Some(writer);
        self
    }

    pub fn sink(mut self, sink: StreamSink) -> Self {
        self.sink = Some(sink);
        self
    }
}
