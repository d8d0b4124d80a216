//! 基于 russh 的 SSH 客户端

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Connector, ExecEvent, InputStream, RemoteShell};
use crate::config::env::SshClientConfig;
use crate::domain::profile::{ConnectionProfile, Credential};
use crate::error::{ConnectError, ExecError};

/// SSH 保活间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// 主机密钥校验
///
/// known_hosts 中没有记录的主机在首次连接时写入；已记录但密钥变化时拒绝
struct ClientHandler {
    host: String,
    port: u16,
    verify: bool,
    mismatch: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.verify {
            return Ok(true);
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                if let Err(e) = russh_keys::learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!(host = %self.host, error = %e, "Failed to record host key");
                } else {
                    info!(
                        host = %self.host,
                        key_type = %server_public_key.name(),
                        "Learned new host key"
                    );
                }
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(host = %self.host, known_hosts_line = line, "Host key changed, refusing connection");
                self.mismatch.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Cannot read known_hosts, accepting host key");
                Ok(true)
            }
        }
    }
}

/// russh 连接器
pub struct RusshConnector {
    config: SshClientConfig,
}

impl RusshConnector {
    pub fn new(config: SshClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Arc<dyn RemoteShell>, ConnectError> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let mismatch = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            host: profile.host.clone(),
            port: profile.port,
            verify: self.config.verify_host_keys,
            mismatch: mismatch.clone(),
        };

        let mut handle = client::connect(ssh_config, (profile.host.as_str(), profile.port), handler)
            .await
            .map_err(|e| map_connect_error(e, &profile.host, mismatch.load(Ordering::SeqCst)))?;

        let authenticated = match &profile.credential {
            Credential::Password(password) => handle
                .authenticate_password(&profile.username, password)
                .await
                .map_err(|e| ConnectError::Protocol(e.to_string()))?,
            Credential::PrivateKey { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    ConnectError::InvalidKey {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                handle
                    .authenticate_publickey(&profile.username, Arc::new(key_pair))
                    .await
                    .map_err(|e| ConnectError::Protocol(e.to_string()))?
            }
        };

        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(ConnectError::AuthenticationFailed {
                host: profile.host.clone(),
                user: profile.username.clone(),
            });
        }

        Ok(Arc::new(RusshShell {
            handle,
            target: profile.display_target(),
        }))
    }
}

fn map_connect_error(err: russh::Error, host: &str, mismatch: bool) -> ConnectError {
    if mismatch {
        return ConnectError::HostKeyMismatch {
            host: host.to_string(),
        };
    }
    match err {
        russh::Error::IO(e) if e.kind() == std::io::ErrorKind::TimedOut => ConnectError::Timeout {
            host: host.to_string(),
        },
        russh::Error::IO(e) => ConnectError::HostUnreachable {
            host: host.to_string(),
            reason: e.to_string(),
        },
        other => ConnectError::Protocol(other.to_string()),
    }
}

/// 已认证的 russh 连接
struct RusshShell {
    handle: Handle<ClientHandler>,
    target: String,
}

impl RusshShell {
    fn channel_error(&self, err: russh::Error) -> ExecError {
        if self.handle.is_closed() {
            ExecError::Disconnected(err.to_string())
        } else {
            ExecError::Channel(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<InputStream>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Result<i32, ExecError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error(e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error(e))?;

        if let Some(reader) = stdin {
            // 远程进程提前退出时写入会失败，退出码仍从 channel 读取
            if let Err(e) = channel.data(reader).await {
                debug!(target = %self.target, error = %e, "Remote stdin closed early");
            }
            let _ = channel.eof().await;
        }

        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    let _ = events.send(ExecEvent::Stdout(data.to_vec())).await;
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    let _ = events.send(ExecEvent::Stderr(data.to_vec())).await;
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    debug!(target = %self.target, signal = ?signal_name, "Remote process killed by signal");
                    exit_code.get_or_insert(-1);
                }
                _ => {}
            }
        }

        match exit_code {
            Some(code) => Ok(code),
            None if self.handle.is_closed() => {
                Err(ExecError::Disconnected("session closed during command".to_string()))
            }
            None => Err(ExecError::Channel("channel closed without exit status".to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(target = %self.target, error = %e, "SSH disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_connect_error_kinds() {
        let refused = russh::Error::IO(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            map_connect_error(refused, "h", false),
            ConnectError::HostUnreachable { .. }
        ));

        let timed_out = russh::Error::IO(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            map_connect_error(timed_out, "h", false),
            ConnectError::Timeout { .. }
        ));

        assert!(matches!(
            map_connect_error(russh::Error::UnknownKey, "h", true),
            ConnectError::HostKeyMismatch { .. }
        ));
    }
}
