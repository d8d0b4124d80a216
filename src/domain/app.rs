//! 应用部署配置领域模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// 部署环境
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    Staging,
}

impl Environment {
    pub const ALL: [Environment; 2] = [Environment::Production, Environment::Staging];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
        }
    }

    /// 未配置分支时的默认分支
    pub fn default_branch(&self) -> &'static str {
        match self {
            Environment::Production => "main",
            Environment::Staging => "dev",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            other => Err(ConfigError::InvalidApplication(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// 源码来源
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    GitRepository { url: String },
    LocalDirectory { path: PathBuf },
}

/// 构建位置
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildLocation {
    Local,
    #[default]
    Remote,
}

/// 单个环境的配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Git 分支（为空时使用环境默认分支）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// 远程部署目录（绝对路径）
    pub remote_path: String,
    /// 注入到容器的环境变量
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// 实际使用的分支
    pub fn effective_branch(&self, env: Environment) -> &str {
        self.branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| env.default_branch())
    }

    /// 规范化后的远程目录
    pub fn normalized_path(&self) -> String {
        normalize_remote_path(&self.remote_path)
    }

    fn validate(&self, env: Environment) -> Result<(), ConfigError> {
        let path = self.remote_path.trim();
        if path.is_empty() {
            return Err(ConfigError::InvalidApplication(format!(
                "{}: remote_path must not be empty",
                env
            )));
        }
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidApplication(format!(
                "{}: remote_path must be absolute, got '{}'",
                env, path
            )));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(ConfigError::InvalidApplication(format!(
                "{}: remote_path must not contain '..', got '{}'",
                env, path
            )));
        }
        if self.normalized_path() == "/" {
            return Err(ConfigError::InvalidApplication(format!(
                "{}: remote_path must not be the filesystem root",
                env
            )));
        }
        if let Some(branch) = &self.branch {
            if branch.contains(char::is_whitespace) || branch.starts_with('-') {
                return Err(ConfigError::InvalidApplication(format!(
                    "{}: invalid branch name '{}'",
                    env, branch
                )));
            }
        }
        for (key, value) in &self.env_vars {
            if !is_valid_env_key(key) {
                return Err(ConfigError::InvalidApplication(format!(
                    "{}: invalid environment variable name '{}'",
                    env, key
                )));
            }
            // 环境变量文件按行解析
            if value.contains(['\n', '\r', '\0']) {
                return Err(ConfigError::InvalidApplication(format!(
                    "{}: value of '{}' must be a single line",
                    env, key
                )));
            }
        }
        Ok(())
    }
}

/// 去掉首尾空白、重复的 `/`、`.` 段与结尾的 `/`
pub fn normalize_remote_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

/// 相同或互相包含的目录
fn paths_overlap(a: &str, b: &str) -> bool {
    let within = |parent: &str, child: &str| child.starts_with(&format!("{}/", parent));
    a == b || within(a, b) || within(b, a)
}

/// 环境变量名：[A-Za-z_][A-Za-z0-9_]*
fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 两个环境的配置
///
/// 线上格式为 `{"production": {...}, "staging": {...}}`，缺少或多出键都会被拒绝
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, EnvironmentConfig>",
    into = "BTreeMap<String, EnvironmentConfig>"
)]
pub struct Environments {
    pub production: EnvironmentConfig,
    pub staging: EnvironmentConfig,
}

impl Environments {
    pub fn get(&self, env: Environment) -> &EnvironmentConfig {
        match env {
            Environment::Production => &self.production,
            Environment::Staging => &self.staging,
        }
    }

    /// 从键值映射构建，要求恰好包含 production 与 staging
    pub fn from_map(mut map: BTreeMap<String, EnvironmentConfig>) -> Result<Self, ConfigError> {
        let production = map.remove("production");
        let staging = map.remove("staging");

        if let Some(extra) = map.keys().next() {
            return Err(ConfigError::InvalidApplication(format!(
                "unexpected environment '{}'; only production and staging are allowed",
                extra
            )));
        }

        match (production, staging) {
            (Some(production), Some(staging)) => Ok(Self {
                production,
                staging,
            }),
            _ => Err(ConfigError::InvalidApplication(
                "both production and staging environments are required".to_string(),
            )),
        }
    }
}

impl TryFrom<BTreeMap<String, EnvironmentConfig>> for Environments {
    type Error = ConfigError;

    fn try_from(map: BTreeMap<String, EnvironmentConfig>) -> Result<Self, Self::Error> {
        Self::from_map(map)
    }
}

impl From<Environments> for BTreeMap<String, EnvironmentConfig> {
    fn from(envs: Environments) -> Self {
        let mut map = BTreeMap::new();
        map.insert("production".to_string(), envs.production);
        map.insert("staging".to_string(), envs.staging);
        map
    }
}

/// 应用配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// 稳定 ID，首次保存时生成
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub source: Source,
    #[serde(default)]
    pub build_location: BuildLocation,
    pub environments: Environments,
    /// 显式指定容器网络（优先于反向代理自动发现）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// 本地构建后保留本地镜像
    #[serde(default)]
    pub keep_local_images: bool,
}

impl ApplicationConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidApplication("name must not be empty".to_string()));
        }
        if !self.id.is_empty() && !is_valid_app_id(&self.id) {
            return Err(ConfigError::InvalidApplication(format!(
                "invalid id '{}'",
                self.id
            )));
        }

        match &self.source {
            Source::GitRepository { url } if url.trim().is_empty() => {
                return Err(ConfigError::InvalidApplication(
                    "git repository url must not be empty".to_string(),
                ));
            }
            Source::LocalDirectory { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::InvalidApplication(
                    "local directory path must not be empty".to_string(),
                ));
            }
            _ => {}
        }

        for env in Environment::ALL {
            self.environments.get(env).validate(env)?;
        }

        let prod = self.environments.production.normalized_path();
        let staging = self.environments.staging.normalized_path();
        if paths_overlap(&prod, &staging) {
            return Err(ConfigError::InvalidApplication(format!(
                "production ({}) and staging ({}) remote paths must not overlap",
                prod, staging
            )));
        }

        Ok(())
    }

    pub fn environment(&self, env: Environment) -> &EnvironmentConfig {
        self.environments.get(env)
    }

    /// 容器命名空间（compose project 名称）：`<id>-<environment>`
    pub fn compose_project(&self, env: Environment) -> String {
        compose_project_name(&self.id, env)
    }
}

/// ID 只允许字母、数字、`-`、`_`
fn is_valid_app_id(id: &str) -> bool {
    id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// compose project 名称只能包含小写字母、数字、`-`、`_`
pub fn compose_project_name(app_id: &str, env: Environment) -> String {
    let slug: String = app_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", slug.trim_matches('-'), env)
}
