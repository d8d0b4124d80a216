//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use constants::*;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 持久化目录（连接配置与应用配置）
    pub data_dir: PathBuf,
    /// SSH 客户端配置
    pub ssh: SshClientConfig,
    /// 部署流水线配置
    pub deploy: DeployConfig,
    /// 输出流 backlog 字节上限
    pub stream_backlog_bytes: usize,
}

/// SSH 客户端配置
#[derive(Clone, Debug)]
pub struct SshClientConfig {
    /// 连接超时
    pub connect_timeout: Duration,
    /// 空闲会话超时
    pub idle_timeout: Duration,
    /// 连接尝试次数（含首次）
    pub connect_attempts: u32,
    /// 重试退避基数
    pub retry_backoff: Duration,
    /// 远程命令默认超时
    pub command_timeout: Duration,
    /// known_hosts 检查：未知主机自动记录，密钥变化时拒绝
    pub verify_host_keys: bool,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(SSH_IDLE_TIMEOUT_SECS),
            connect_attempts: SSH_CONNECT_ATTEMPTS,
            retry_backoff: Duration::from_millis(SSH_RETRY_BACKOFF_MS),
            command_timeout: Duration::from_secs(REMOTE_COMMAND_TIMEOUT_SECS),
            verify_host_keys: true,
        }
    }
}

impl SshClientConfig {
    /// 从环境变量加载 SSH 配置
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: env_secs("SSH_CONNECT_TIMEOUT_SECS").unwrap_or(defaults.connect_timeout),
            idle_timeout: env_secs("SSH_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            connect_attempts: env_parse("SSH_CONNECT_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.connect_attempts),
            retry_backoff: defaults.retry_backoff,
            command_timeout: env_secs("REMOTE_COMMAND_TIMEOUT_SECS")
                .unwrap_or(defaults.command_timeout),
            verify_host_keys: env_flag("SSH_VERIFY_HOST_KEYS").unwrap_or(true),
        }
    }
}

/// 部署流水线配置
#[derive(Clone, Debug)]
pub struct DeployConfig {
    /// 单个步骤（clone / build / up）的超时
    pub step_timeout: Duration,
    /// 发布后等待容器运行的宽限期
    pub health_grace: Duration,
    /// 健康检查轮询间隔
    pub verify_interval: Duration,
    /// 远程 docker 可执行文件
    pub docker_bin: String,
    /// 本地 docker 可执行文件
    pub local_docker_bin: String,
    /// 失败记录保留的输出行数
    pub failure_tail_lines: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(DEPLOY_STEP_TIMEOUT_SECS),
            health_grace: Duration::from_secs(DEPLOY_HEALTH_GRACE_SECS),
            verify_interval: Duration::from_secs(DEPLOY_VERIFY_INTERVAL_SECS),
            docker_bin: "docker".to_string(),
            local_docker_bin: "docker".to_string(),
            failure_tail_lines: FAILURE_TAIL_LINES,
        }
    }
}

impl DeployConfig {
    /// 从环境变量加载部署配置
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            step_timeout: env_secs("DEPLOY_STEP_TIMEOUT_SECS").unwrap_or(defaults.step_timeout),
            health_grace: env_secs("DEPLOY_HEALTH_GRACE_SECS").unwrap_or(defaults.health_grace),
            verify_interval: defaults.verify_interval,
            docker_bin: env::var("DOCKER_BIN")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.docker_bin),
            local_docker_bin: env::var("LOCAL_DOCKER_BIN")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.local_docker_bin),
            failure_tail_lines: defaults.failure_tail_lines,
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = env::var("ENGINE_API_KEY").unwrap_or_else(|_| {
            warn!("ENGINE_API_KEY not set, using insecure default");
            "change-me-in-production".to_string()
        });

        let port = env_parse("PORT").unwrap_or(DEFAULT_PORT);

        let data_dir = env::var("ENGINE_DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let stream_backlog_bytes = env_parse("STREAM_BACKLOG_BYTES")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(STREAM_BACKLOG_BYTES);

        Self {
            api_key,
            port,
            data_dir,
            ssh: SshClientConfig::from_env(),
            deploy: DeployConfig::from_env(),
            stream_backlog_bytes,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            ssh: SshClientConfig::default(),
            deploy: DeployConfig::default(),
            stream_backlog_bytes: STREAM_BACKLOG_BYTES,
        }
    }
}

/// 默认数据目录：用户数据目录下的 remote-deploy-engine
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("remote-deploy-engine"))
        .unwrap_or_else(|| PathBuf::from(".remote-deploy-engine"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// 常量
pub mod constants {
    /// 服务默认端口
    pub const DEFAULT_PORT: u16 = 9877;

    /// SSH 默认端口
    pub const DEFAULT_SSH_PORT: u16 = 22;

    /// SSH 连接超时（秒）
    pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 15;

    /// 空闲会话超时（秒）
    pub const SSH_IDLE_TIMEOUT_SECS: u64 = 600;

    /// 连接尝试次数
    pub const SSH_CONNECT_ATTEMPTS: u32 = 2;

    /// 重试退避（毫秒），按尝试次数线性增长
    pub const SSH_RETRY_BACKOFF_MS: u64 = 500;

    /// 远程命令默认超时（秒）
    pub const REMOTE_COMMAND_TIMEOUT_SECS: u64 = 60;

    /// 部署步骤超时（秒）
    pub const DEPLOY_STEP_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 健康检查宽限期（秒）
    pub const DEPLOY_HEALTH_GRACE_SECS: u64 = 30;

    /// 健康检查轮询间隔（秒）
    pub const DEPLOY_VERIFY_INTERVAL_SECS: u64 = 2;

    /// 失败记录保留的输出行数
    pub const FAILURE_TAIL_LINES: usize = 40;

    /// 每个输出通道的 backlog 上限（字节）
    pub const STREAM_BACKLOG_BYTES: usize = 64 * 1024;

    /// 每个订阅者的待投递队列长度
    pub const STREAM_SUBSCRIBER_CAPACITY: usize = 1024;

    /// 运行历史最大保存数量
    pub const MAX_RUN_HISTORY: usize = 200;

    /// 后台清理间隔（秒）
    pub const MAINTENANCE_INTERVAL_SECS: u64 = 60;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
