//! 测试用的脚本化远程主机

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::{Connector, ExecEvent, InputStream, RemoteShell};
use crate::domain::profile::ConnectionProfile;
use crate::error::{ConnectError, ExecError};

#[derive(Clone, Debug)]
enum Behavior {
    Complete,
    Hang,
    Disconnect,
    Delay(Duration),
}

/// 脚本化响应
#[derive(Clone, Debug)]
pub(crate) struct FakeResponse {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i32,
    behavior: Behavior,
}

impl FakeResponse {
    pub(crate) fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
            behavior: Behavior::Complete,
        }
    }

    pub(crate) fn exit(code: i32, stderr: &str) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: code,
            behavior: Behavior::Complete,
        }
    }

    /// 永不结束（用于超时与取消）
    pub(crate) fn hang() -> Self {
        Self {
            behavior: Behavior::Hang,
            ..Self::ok("")
        }
    }

    /// 连接在执行中断开
    pub(crate) fn disconnect() -> Self {
        Self {
            behavior: Behavior::Disconnect,
            ..Self::ok("")
        }
    }

    pub(crate) fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.as_bytes().to_vec();
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.behavior = Behavior::Delay(delay);
        self
    }
}

struct Rule {
    pattern: String,
    response: FakeResponse,
    remaining: Option<usize>,
}

/// 脚本化的 SSH 连接
///
/// 按子串匹配命令，先注册的规则优先；`on_once` 注册的规则用过一次后失效。
/// 未匹配的命令返回空输出、退出码 0
pub(crate) struct FakeShell {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    stdin: Mutex<Vec<(String, Vec<u8>)>>,
    closed: AtomicBool,
}

impl FakeShell {
    /// 包装命令报告的 PID
    pub(crate) const PID: u32 = 4242;

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            stdin: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn on(&self, pattern: &str, response: FakeResponse) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            response,
            remaining: None,
        });
    }

    /// 只生效一次，优先于已有规则
    pub(crate) fn on_once(&self, pattern: &str, response: FakeResponse) {
        self.rules.lock().unwrap().insert(
            0,
            Rule {
                pattern: pattern.to_string(),
                response,
                remaining: Some(1),
            },
        );
    }

    /// 执行过的命令（已去掉 PID 包装）
    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub(crate) fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    /// 某条命令收到的标准输入
    pub(crate) fn stdin_for(&self, pattern: &str) -> Option<Vec<u8>> {
        self.stdin
            .lock()
            .unwrap()
            .iter()
            .find(|(command, _)| command.contains(pattern))
            .map(|(_, data)| data.clone())
    }

    fn respond(&self, command: &str) -> FakeResponse {
        let mut rules = self.rules.lock().unwrap();
        let index = rules
            .iter()
            .position(|r| command.contains(&r.pattern) && r.remaining != Some(0));
        match index {
            Some(i) => {
                let rule = &mut rules[i];
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.response.clone()
            }
            None => FakeResponse::ok(""),
        }
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<InputStream>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Result<i32, ExecError> {
        if self.is_closed() {
            return Err(ExecError::Disconnected("session closed".into()));
        }

        let (command, wrapped) = match unwrap_command(command) {
            Some(inner) => (inner, true),
            None => (command.to_string(), false),
        };
        self.commands.lock().unwrap().push(command.clone());

        if let Some(mut reader) = stdin {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .await
                .map_err(|e| ExecError::Io(e.to_string()))?;
            self.stdin.lock().unwrap().push((command.clone(), data));
        }

        let response = self.respond(&command);
        if wrapped {
            let marker = format!("__REMOTE_PID={}\n", Self::PID);
            let _ = events.send(ExecEvent::Stderr(marker.into_bytes())).await;
        }

        match response.behavior {
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Disconnect => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(ExecError::Disconnected("connection reset by peer".into()));
            }
            Behavior::Delay(delay) => tokio::time::sleep(delay).await,
            Behavior::Complete => {}
        }

        if !response.stdout.is_empty() {
            let _ = events.send(ExecEvent::Stdout(response.stdout)).await;
        }
        if !response.stderr.is_empty() {
            let _ = events.send(ExecEvent::Stderr(response.stderr)).await;
        }
        Ok(response.exit_code)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// 还原 `exec sh -c '<printf ...; exec sh -c '<cmd>'>'` 中的原始命令
fn unwrap_command(command: &str) -> Option<String> {
    let outer = unquote(command.strip_prefix("exec sh -c ")?);
    let (_, inner) = outer.split_once("; exec sh -c ")?;
    Some(unquote(inner))
}

/// POSIX shell 引号还原（只处理单引号与反斜杠）
fn unquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_quote = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match (in_quote, c) {
            (true, '\'') => in_quote = false,
            (true, c) => out.push(c),
            (false, '\'') => in_quote = true,
            (false, '\\') => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            (false, c) => out.push(c),
        }
    }
    out
}

enum ConnectOutcome {
    Fail(ConnectError),
    Hang,
}

/// 脚本化的连接器：每次连接创建新的 FakeShell
pub(crate) struct FakeConnector {
    setup: Box<dyn Fn(&FakeShell) + Send + Sync>,
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    attempts: AtomicUsize,
    shells: Mutex<Vec<Arc<FakeShell>>>,
}

impl FakeConnector {
    pub(crate) fn new(setup: impl Fn(&FakeShell) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            setup: Box::new(setup),
            outcomes: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            shells: Mutex::new(Vec::new()),
        })
    }

    /// 下一次连接失败
    pub(crate) fn fail_next(&self, err: ConnectError) {
        self.outcomes.lock().unwrap().push_back(ConnectOutcome::Fail(err));
    }

    /// 下一次连接永不返回
    pub(crate) fn hang_next(&self) {
        self.outcomes.lock().unwrap().push_back(ConnectOutcome::Hang);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 已建立的连接
    pub(crate) fn shells(&self) -> Vec<Arc<FakeShell>> {
        self.shells.lock().unwrap().clone()
    }

    pub(crate) fn last_shell(&self) -> Arc<FakeShell> {
        self.shells().last().cloned().expect("no connection established")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _profile: &ConnectionProfile) -> Result<Arc<dyn RemoteShell>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            Some(ConnectOutcome::Fail(err)) => return Err(err),
            Some(ConnectOutcome::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let shell = FakeShell::new();
        (self.setup)(&shell);
        self.shells.lock().unwrap().push(shell.clone());
        Ok(shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_command_roundtrip() {
        let original = "docker ps -a --format '{{json .}}'";
        let quoted = crate::infra::shell_quote(original);
        let inner = format!("printf '__REMOTE_PID=%s\\n' \"$$\" >&2; exec sh -c {}", quoted);
        let wrapped = format!("exec sh -c {}", crate::infra::shell_quote(&inner));
        assert_eq!(unwrap_command(&wrapped).as_deref(), Some(original));
        assert_eq!(unwrap_command("kill -TERM -- -1"), None);
    }
}
