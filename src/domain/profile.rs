//! SSH 连接配置领域模型

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

use crate::config::env::constants::DEFAULT_SSH_PORT;
use crate::error::ConfigError;

/// 认证凭据（密码与私钥互斥）
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// 密码认证
    Password(String),
    /// 私钥认证，可选口令
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl Credential {
    /// 凭据的身份标识（用于指纹，不直接包含密码）
    fn identity(&self) -> String {
        match self {
            Credential::Password(secret) => {
                let digest = Sha256::digest(secret.as_bytes());
                format!("password:{:x}", digest)
            }
            Credential::PrivateKey { path, .. } => format!("key:{}", path.display()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// 连接配置
///
/// 反序列化时校验：password 与 private_key_path 必须且只能提供一个
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProfile", into = "RawProfile")]
pub struct ConnectionProfile {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub credential: Credential,
}

/// 连接配置的线上格式
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawProfile {
    host: String,
    username: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    passphrase: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl TryFrom<RawProfile> for ConnectionProfile {
    type Error = ConfigError;

    fn try_from(raw: RawProfile) -> Result<Self, Self::Error> {
        let credential = match (raw.password, raw.private_key_path) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidProfile(
                    "provide either a password or a private key, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::InvalidProfile(
                    "a password or a private key is required".to_string(),
                ))
            }
            (Some(password), None) => Credential::Password(password),
            (None, Some(path)) => Credential::PrivateKey {
                path,
                passphrase: raw.passphrase.filter(|p| !p.is_empty()),
            },
        };

        ConnectionProfile::new(raw.host, raw.username, raw.port, credential)
    }
}

impl From<ConnectionProfile> for RawProfile {
    fn from(profile: ConnectionProfile) -> Self {
        let (password, private_key_path, passphrase) = match profile.credential {
            Credential::Password(p) => (Some(p), None, None),
            Credential::PrivateKey { path, passphrase } => (None, Some(path), passphrase),
        };
        Self {
            host: profile.host,
            username: profile.username,
            port: profile.port,
            password,
            private_key_path,
            passphrase,
        }
    }
}

impl ConnectionProfile {
    /// 创建并校验连接配置
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        port: u16,
        credential: Credential,
    ) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        let username = username.into().trim().to_string();

        if host.is_empty() {
            return Err(ConfigError::InvalidProfile("host must not be empty".to_string()));
        }
        if username.is_empty() {
            return Err(ConfigError::InvalidProfile("username must not be empty".to_string()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidProfile("port must be non-zero".to_string()));
        }
        if let Credential::PrivateKey { path, .. } = &credential {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidProfile(
                    "private key path must not be empty".to_string(),
                ));
            }
        }

        Ok(Self {
            host,
            username,
            port,
            credential,
        })
    }

    /// 会话缓存键：host + user + port + 凭据身份
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.host.as_bytes());
        hasher.update([0]);
        hasher.update(self.username.as_bytes());
        hasher.update([0]);
        hasher.update(self.port.to_be_bytes());
        hasher.update([0]);
        hasher.update(self.credential.identity().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// user@host:port
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// 去除密码/口令后的副本（用于 API 返回）
    pub fn redacted(&self) -> RedactedProfile {
        let (auth, private_key_path) = match &self.credential {
            Credential::Password(_) => ("password", None),
            Credential::PrivateKey { path, .. } => ("private_key", Some(path.clone())),
        };
        RedactedProfile {
            host: self.host.clone(),
            username: self.username.clone(),
            port: self.port,
            auth: auth.to_string(),
            private_key_path,
        }
    }
}

/// 不含密钥信息的连接配置
#[derive(Clone, Debug, Serialize)]
pub struct RedactedProfile {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

/// 本地发现的密钥
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocalKey {
    /// 文件名（不含 .pub）
    pub name: String,
    /// 私钥路径
    pub path: PathBuf,
    pub public_key_path: PathBuf,
    /// 公钥类型（如 ssh-ed25519）
    pub key_type: String,
}

/// 新生成的密钥对
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneratedKey {
    pub private_key_path: PathBuf,
    /// authorized_keys 格式的公钥
    pub public_key: String,
}

/// 连接测试结果
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    pub target: String,
    pub fingerprint: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// 远程 `uname -a` 输出
    pub remote_system: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_profile() -> ConnectionProfile {
        ConnectionProfile::new("10.0.0.5", "root", 22, Credential::Password("s3cret".into())).unwrap()
    }

    #[test]
    fn test_profile_rejects_both_credentials() {
        let json = r#"{"host":"h","username":"u","password":"p","private_key_path":"/k"}"#;
        let err = serde_json::from_str::<ConnectionProfile>(json).unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_profile_rejects_missing_credentials() {
        let json = r#"{"host":"h","username":"u"}"#;
        assert!(serde_json::from_str::<ConnectionProfile>(json).is_err());
    }

    #[test]
    fn test_profile_defaults_port() {
        let json = r#"{"host":"h","username":"u","private_key_path":"/k","passphrase":""}"#;
        let profile: ConnectionProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.port, 22);
        assert_eq!(
            profile.credential,
            Credential::PrivateKey {
                path: PathBuf::from("/k"),
                passphrase: None
            }
        );
    }

    #[test]
    fn test_fingerprint_depends_on_credential() {
        let a = password_profile();
        let mut b = a.clone();
        b.credential = Credential::Password("other".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), password_profile().fingerprint());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", password_profile());
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_serialization_roundtrip_keeps_secret() {
        let profile = password_profile();
        let json = serde_json::to_string(&profile).unwrap();
        let back: ConnectionProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }
}
