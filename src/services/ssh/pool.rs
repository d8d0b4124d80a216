//! 连接管理
//!
//! 按连接配置指纹缓存会话，断开的会话自动重建，临时错误有限重试

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connector, RemoteShell, Session};
use crate::config::env::SshClientConfig;
use crate::domain::profile::{ConnectionInfo, ConnectionProfile};
use crate::error::{ConnectError, EngineError, EngineResult, ExecError};

/// 连接管理器
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: SshClientConfig,
    /// fingerprint -> session
    sessions: Mutex<HashMap<String, Session>>,
    /// fingerprint -> 建连锁；同一配置不会重复连接，不同配置互不阻塞
    connecting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: SshClientConfig) -> Self {
        Self {
            connector,
            config,
            sessions: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
        }
    }

    /// 获取会话：复用缓存，已关闭的会话被移除并重建
    pub async fn acquire(&self, profile: &ConnectionProfile) -> Result<Session, ConnectError> {
        let fingerprint = profile.fingerprint();
        if let Some(session) = self.cached(&fingerprint).await {
            return Ok(session);
        }

        let gate = self
            .connecting
            .lock()
            .await
            .entry(fingerprint.clone())
            .or_default()
            .clone();
        let _gate = gate.lock().await;

        // 等待期间可能已由其他任务建立
        if let Some(session) = self.cached(&fingerprint).await {
            return Ok(session);
        }

        let shell = self.connect_with_retry(profile).await?;
        let session = Session::new(
            shell,
            fingerprint.clone(),
            profile.display_target(),
            self.config.command_timeout,
        );
        self.sessions.lock().await.insert(fingerprint, session.clone());
        Ok(session)
    }

    /// 获取会话，建立连接期间响应取消
    pub async fn acquire_until(
        &self,
        profile: &ConnectionProfile,
        cancel: &CancellationToken,
    ) -> EngineResult<Session> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled.into()),
            result = self.acquire(profile) => Ok(result?),
        }
    }

    /// 缓存中可用的会话；已关闭的会话顺带移除
    async fn cached(&self, fingerprint: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(fingerprint)?;
        if !session.is_closed() {
            session.touch();
            return Some(session.clone());
        }
        debug!(target = %session.target(), "Cached session closed, reconnecting");
        sessions.remove(fingerprint);
        None
    }

    /// 建立连接；HostUnreachable / Timeout 按退避重试，其余错误直接返回
    async fn connect_with_retry(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn RemoteShell>, ConnectError> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(profile),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout {
                    host: profile.host.clone(),
                }),
            };

            match result {
                Ok(shell) => {
                    info!(target = %profile.display_target(), attempt, "SSH session established");
                    return Ok(shell);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.config.retry_backoff * attempt;
                    warn!(
                        target = %profile.display_target(),
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "SSH connect failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(target = %profile.display_target(), attempt, error = %e, "SSH connect failed");
                    return Err(e);
                }
            }
        }
    }

    /// 在会话中执行操作
    ///
    /// 成功时会话留在缓存中；会话级错误或 panic 时移除会话（panic 随后继续传播）
    pub async fn with_session<T, F, Fut>(&self, profile: &ConnectionProfile, f: F) -> EngineResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        self.with_session_until(profile, &CancellationToken::new(), f).await
    }

    /// 同 `with_session`，取消令牌触发时放弃建立连接
    pub async fn with_session_until<T, F, Fut>(
        &self,
        profile: &ConnectionProfile,
        cancel: &CancellationToken,
        f: F,
    ) -> EngineResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let session = self.acquire_until(profile, cancel).await?;
        let lease = session.lease();
        let outcome = AssertUnwindSafe(f(session.clone())).catch_unwind().await;
        drop(lease);

        match outcome {
            Ok(Ok(value)) => {
                session.touch();
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.is_session_fatal() || session.is_closed() {
                    warn!(target = %session.target(), error = %e, "Evicting broken session");
                    self.evict(&session).await;
                }
                Err(e)
            }
            Err(panic) => {
                warn!(target = %session.target(), "Operation panicked, evicting session");
                self.evict(&session).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// 移除指定会话（仅当缓存中仍是同一个会话）
    async fn evict(&self, session: &Session) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(session.fingerprint()) {
                Some(cached) if cached.id() == session.id() => sessions.remove(session.fingerprint()),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.close().await;
        }
    }

    /// 测试连接：使用独立的新连接，不进入缓存
    pub async fn test(&self, profile: &ConnectionProfile) -> EngineResult<ConnectionInfo> {
        let shell = self.connect_with_retry(profile).await?;
        let session = Session::new(
            shell,
            profile.fingerprint(),
            profile.display_target(),
            self.config.command_timeout,
        );

        let result = session.run("echo ok && uname -srm").await;
        session.close().await;
        let output = result?;

        let mut lines = output.stdout.lines();
        if !output.success() || lines.next().map(str::trim) != Some("ok") {
            return Err(EngineError::Remote(format!(
                "health check failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(ConnectionInfo {
            target: profile.display_target(),
            fingerprint: profile.fingerprint(),
            connected_at: chrono::Utc::now(),
            remote_system: lines.next().unwrap_or_default().trim().to_string(),
        })
    }

    /// 主动断开
    pub async fn disconnect(&self, profile: &ConnectionProfile) -> bool {
        let removed = self.sessions.lock().await.remove(&profile.fingerprint());
        match removed {
            Some(session) => {
                session.close().await;
                info!(target = %session.target(), "SSH session disconnected");
                true
            }
            None => false,
        }
    }

    /// 清理空闲或已关闭的会话，返回清理数量
    ///
    /// 有进行中命令的会话不算空闲
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let stale: Vec<Session> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_closed() || (!s.is_busy() && s.idle_for() >= idle_timeout))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        self.connecting
            .lock()
            .await
            .retain(|_, gate| Arc::strong_count(gate) > 1);

        for session in &stale {
            debug!(target = %session.target(), "Closing idle session");
            session.close().await;
        }
        stale.len()
    }

    /// 关闭全部会话
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::Credential;
    use crate::error::ExecError;
    use crate::services::ssh::fake::{FakeConnector, FakeResponse};
    use crate::services::ssh::ExecOptions;
    use std::time::{Duration, Instant};

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("10.0.0.5", "root", 22, Credential::Password("pw".into())).unwrap()
    }

    fn config() -> SshClientConfig {
        SshClientConfig {
            connect_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(1),
            ..SshClientConfig::default()
        }
    }

    fn manager(connector: Arc<FakeConnector>) -> ConnectionManager {
        ConnectionManager::new(connector, config())
    }

    #[tokio::test]
    async fn test_sessions_reused_per_fingerprint() {
        let connector = FakeConnector::new(|_| {});
        let manager = manager(connector.clone());

        let a = manager.acquire(&profile()).await.unwrap();
        let b = manager.acquire(&profile()).await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let connector = FakeConnector::new(|_| {});
        connector.fail_next(ConnectError::HostUnreachable {
            host: "10.0.0.5".into(),
            reason: "connection refused".into(),
        });
        let manager = manager(connector.clone());

        assert!(manager.acquire(&profile()).await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_gives_up_after_two_attempts() {
        let connector = FakeConnector::new(|_| {});
        for _ in 0..3 {
            connector.fail_next(ConnectError::HostUnreachable {
                host: "10.0.0.5".into(),
                reason: "no route".into(),
            });
        }
        let manager = manager(connector.clone());

        let err = manager.acquire(&profile()).await.unwrap_err();
        assert!(matches!(err, ConnectError::HostUnreachable { .. }));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let connector = FakeConnector::new(|_| {});
        connector.fail_next(ConnectError::AuthenticationFailed {
            host: "10.0.0.5".into(),
            user: "root".into(),
        });
        let manager = manager(connector.clone());

        let err = manager.acquire(&profile()).await.unwrap_err();
        assert!(matches!(err, ConnectError::AuthenticationFailed { .. }));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_bounded() {
        let connector = FakeConnector::new(|_| {});
        connector.hang_next();
        connector.hang_next();
        let manager = manager(connector.clone());

        let err = manager.acquire(&profile()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_closed_session_transparently_reestablished() {
        let connector = FakeConnector::new(|_| {});
        let manager = manager(connector.clone());

        let first = manager.acquire(&profile()).await.unwrap();
        first.close().await;
        let second = manager.acquire(&profile()).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_with_session_evicts_on_disconnect() {
        let connector = FakeConnector::new(|shell| shell.on("uptime", FakeResponse::disconnect()));
        let manager = manager(connector.clone());

        let err = manager
            .with_session(&profile(), |session| async move {
                session.run("uptime").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exec(ExecError::Disconnected(_))));
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_with_session_keeps_session_on_command_failure() {
        let connector = FakeConnector::new(|shell| shell.on("false", FakeResponse::exit(1, "")));
        let manager = manager(connector.clone());

        let code = manager
            .with_session(&profile(), |session| async move {
                Ok(session.run("false").await?.exit_code)
            })
            .await
            .unwrap();
        assert_eq!(code, 1);
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_with_session_evicts_and_resumes_panic() {
        let connector = FakeConnector::new(|_| {});
        let manager = Arc::new(manager(connector.clone()));

        let inner = manager.clone();
        let result = tokio::spawn(async move {
            inner
                .with_session(&profile(), |_session| async move {
                    if true {
                        panic!("operation bug");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(manager.session_count().await, 0);
        assert!(connector.last_shell().is_closed());
    }

    #[tokio::test]
    async fn test_health_check_uses_fresh_session() {
        let connector = FakeConnector::new(|shell| {
            shell.on("echo ok", FakeResponse::ok("ok\nLinux 6.1.0 x86_64\n"))
        });
        let manager = manager(connector.clone());

        let info = manager.test(&profile()).await.unwrap();
        assert_eq!(info.remote_system, "Linux 6.1.0 x86_64");
        assert_eq!(info.target, "root@10.0.0.5:22");
        assert_eq!(manager.session_count().await, 0);
        assert!(connector.last_shell().is_closed());
    }

    #[tokio::test]
    async fn test_evict_idle_and_disconnect() {
        let connector = FakeConnector::new(|_| {});
        let manager = ConnectionManager::new(
            connector.clone(),
            SshClientConfig {
                idle_timeout: Duration::from_millis(10),
                ..config()
            },
        );

        manager.acquire(&profile()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.evict_idle().await, 1);
        assert_eq!(manager.session_count().await, 0);

        manager.acquire(&profile()).await.unwrap();
        assert!(manager.disconnect(&profile()).await);
        assert!(!manager.disconnect(&profile()).await);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_session_with_running_command() {
        let connector = FakeConnector::new(|shell| shell.on("docker build", FakeResponse::hang()));
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            SshClientConfig {
                idle_timeout: Duration::from_millis(10),
                ..config()
            },
        ));
        let cancel = CancellationToken::new();

        let worker = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .with_session(&profile(), |session| async move {
                        session
                            .exec("docker build .", ExecOptions::new().cancel(cancel))
                            .await?;
                        Ok(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.evict_idle().await, 0);
        assert_eq!(manager.session_count().await, 1);
        assert!(!connector.last_shell().is_closed());

        cancel.cancel();
        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Exec(ExecError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.evict_idle().await, 1);
    }

    #[tokio::test]
    async fn test_slow_connect_does_not_block_other_profiles() {
        let connector = FakeConnector::new(|_| {});
        connector.hang_next();
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            SshClientConfig {
                connect_timeout: Duration::from_secs(5),
                connect_attempts: 1,
                ..config()
            },
        ));

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&profile()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = ConnectionProfile::new("10.0.0.6", "root", 22, Credential::Password("pw".into())).unwrap();
        let session = tokio::time::timeout(Duration::from_millis(500), manager.acquire(&other))
            .await
            .expect("acquire blocked by another profile")
            .unwrap();
        assert_eq!(session.target(), "root@10.0.0.6:22");
        tokio::time::timeout(Duration::from_millis(500), manager.evict_idle())
            .await
            .expect("eviction blocked by a pending connect");

        slow.abort();
    }

    #[tokio::test]
    async fn test_cancel_abandons_pending_connect() {
        let connector = FakeConnector::new(|_| {});
        connector.hang_next();
        let manager = ConnectionManager::new(
            connector.clone(),
            SshClientConfig {
                connect_timeout: Duration::from_secs(5),
                connect_attempts: 1,
                ..config()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = manager.acquire_until(&profile(), &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Exec(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.session_count().await, 0);
    }
}
