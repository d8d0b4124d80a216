//! 连接配置与应用配置持久化
//!
//! 单个 JSON 文件，写入时先写临时文件再原子重命名；Unix 下权限为 0600

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::app::{ApplicationConfig, Environment};
use crate::domain::profile::ConnectionProfile;
use crate::error::{ConfigError, EngineError, EngineResult};

/// 持久化文件名
const STATE_FILE_NAME: &str = "engine-state.json";

/// 当前文件格式版本
const STATE_VERSION: u32 = 1;

/// 持久化内容
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<ConnectionProfile>,
    #[serde(default)]
    applications: BTreeMap<String, ApplicationConfig>,
    saved_at: DateTime<Utc>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            profile: None,
            applications: BTreeMap::new(),
            saved_at: Utc::now(),
        }
    }
}

/// 配置存储
pub struct CredentialStore {
    path: PathBuf,
    state: RwLock<PersistedState>,
}

impl CredentialStore {
    /// 打开数据目录下的存储文件，不存在时为空
    ///
    /// 无法解析的文件会被改名为 `.corrupt` 保留，然后从空状态开始
    pub async fn open(data_dir: &Path) -> EngineResult<Self> {
        let path = data_dir.join(STATE_FILE_NAME);
        let state = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<PersistedState>(&content) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        applications = state.applications.len(),
                        has_profile = state.profile.is_some(),
                        "Loaded persisted engine state"
                    );
                    state
                }
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "Failed to parse persisted state, starting empty"
                    );
                    fs::rename(&path, &backup)
                        .await
                        .map_err(|e| EngineError::Store(e.to_string()))?;
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => {
                return Err(EngineError::Store(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 当前连接配置
    pub async fn profile(&self) -> Option<ConnectionProfile> {
        self.state.read().await.profile.clone()
    }

    /// 当前连接配置，未配置时报错
    pub async fn require_profile(&self) -> Result<ConnectionProfile, ConfigError> {
        self.profile().await.ok_or(ConfigError::MissingProfile)
    }

    /// 替换连接配置
    pub async fn save_profile(&self, profile: ConnectionProfile) -> EngineResult<()> {
        let target = profile.display_target();
        self.mutate(|state| {
            state.profile = Some(profile);
            Ok(())
        })
        .await?;
        info!(target = %target, "Connection profile saved");
        Ok(())
    }

    pub async fn application(&self, app_id: &str) -> Option<ApplicationConfig> {
        self.state.read().await.applications.get(app_id).cloned()
    }

    /// 查找应用，不存在时报错
    pub async fn require_application(&self, app_id: &str) -> EngineResult<ApplicationConfig> {
        self.application(app_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("application '{}'", app_id)))
    }

    pub async fn applications(&self) -> Vec<ApplicationConfig> {
        self.state.read().await.applications.values().cloned().collect()
    }

    /// 保存应用配置；ID 为空时生成，之后保持不变
    pub async fn save_application(&self, mut config: ApplicationConfig) -> EngineResult<ApplicationConfig> {
        config.validate()?;
        if config.id.is_empty() {
            config.id = generate_app_id();
        }

        let saved = config.clone();
        self.mutate(move |state| {
            // 容器命名空间必须唯一（ID 只差大小写时 compose project 相同）
            let project = config.compose_project(Environment::Production);
            if let Some(other) = state
                .applications
                .values()
                .find(|a| a.id != config.id && a.compose_project(Environment::Production) == project)
            {
                return Err(ConfigError::InvalidApplication(format!(
                    "id '{}' maps to the same container namespace as application '{}'",
                    config.id, other.id
                ))
                .into());
            }
            state.applications.insert(config.id.clone(), config);
            Ok(())
        })
        .await?;

        info!(app = %saved.id, name = %saved.name, "Application saved");
        Ok(saved)
    }

    /// 删除应用，返回是否存在
    pub async fn delete_application(&self, app_id: &str) -> EngineResult<bool> {
        let mut removed = false;
        self.mutate(|state| {
            removed = state.applications.remove(app_id).is_some();
            Ok(())
        })
        .await?;

        if removed {
            info!(app = %app_id, "Application deleted");
        }
        Ok(removed)
    }

    /// 在副本上修改并落盘，成功后才替换内存状态
    async fn mutate<F>(&self, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut PersistedState) -> EngineResult<()>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        f(&mut next)?;
        next.saved_at = Utc::now();
        next.version = STATE_VERSION;
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    /// 原子写入
    async fn persist(&self, state: &PersistedState) -> EngineResult<()> {
        let temp_path = self.path.with_extension("json.tmp");
        let content =
            serde_json::to_string_pretty(state).map_err(|e| EngineError::Store(e.to_string()))?;

        let write = async {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&temp_path, &content).await?;
            restrict_permissions(&temp_path).await?;
            fs::rename(&temp_path, &self.path).await
        };

        write.await.map_err(|e| {
            EngineError::Store(format!("cannot write {}: {}", self.path.display(), e))
        })
    }
}

/// 新应用 ID
fn generate_app_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
