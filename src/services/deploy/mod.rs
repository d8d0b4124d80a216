//! 部署编排
//!
//! 状态机：Idle → Acquiring → Building → RollingOut → Verifying → Succeeded，
//! 任一非终态都可能进入 Failed。不做自动回滚

pub mod build;
pub mod context;
pub mod package;
pub mod rollout;
pub mod source;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::env::DeployConfig;
use crate::domain::app::{ApplicationConfig, Environment};
use crate::domain::deploy::{DeployTarget, DeploymentRun, RunState, TargetStatus};
use crate::domain::profile::ConnectionProfile;
use crate::error::{EngineError, EngineResult};
use crate::services::containers::ContainerRegistry;
use crate::services::remote_fs::RemoteFileSystem;
use crate::services::ssh::{ConnectionManager, Session};
use crate::state::run_store::RunStore;
use crate::state::stream_hub::{StreamHub, StreamSink};

pub use context::DeployContext;

/// 部署输出通道名
pub fn channel_name(app_id: &str, environment: Environment) -> String {
    format!("deploy/{}/{}", app_id, environment)
}

/// 部署编排器
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    connections: Arc<ConnectionManager>,
    runs: Arc<RunStore>,
    hub: Arc<StreamHub>,
    config: DeployConfig,
}

impl DeploymentOrchestrator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        runs: Arc<RunStore>,
        hub: Arc<StreamHub>,
        config: DeployConfig,
    ) -> Self {
        Self {
            connections,
            runs,
            hub,
            config,
        }
    }

    /// 开始部署
    ///
    /// 同一 (应用, 环境) 已有活跃运行时立即返回 DeploymentAlreadyInProgress；
    /// 流水线在后台执行，返回值是初始运行记录
    pub async fn start(
        &self,
        profile: ConnectionProfile,
        app: ApplicationConfig,
        environment: Environment,
    ) -> EngineResult<DeploymentRun> {
        app.validate()?;
        let target = DeployTarget::new(app.id.clone(), environment);
        let (run, cancel_token) = self.runs.try_begin(&target).await?;

        let sink = StreamSink::new(self.hub.clone(), channel_name(&app.id, environment))
            .with_tail(self.config.failure_tail_lines);
        let ctx = DeployContext::new(
            run.id.clone(),
            target,
            app,
            self.runs.clone(),
            sink,
            cancel_token,
            self.config.clone(),
        );

        info!(
            run_id = %ctx.run_id,
            target = %ctx.target,
            host = %profile.host,
            "Starting deployment"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.execute(ctx, profile).await;
        });

        Ok(run)
    }

    /// 执行流水线并写入终态
    async fn execute(&self, ctx: DeployContext, profile: ConnectionProfile) {
        ctx.log_system(format!(
            "=== Deploy {} ({}) to {} ===",
            ctx.target,
            ctx.app.name,
            profile.display_target()
        ))
        .await;
        ctx.log_system(format!("Remote path: {}", ctx.remote_path())).await;
        ctx.log_system(format!("Timestamp: {}", chrono::Utc::now().to_rfc3339()))
            .await;

        ctx.transition(RunState::Acquiring).await;

        let pipeline = self
            .connections
            .with_session_until(&profile, &ctx.cancel_token, |session| run_pipeline(&ctx, session));
        let result = match AssertUnwindSafe(pipeline).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(run_id = %ctx.run_id, target = %ctx.target, "Deployment task panicked");
                Err(EngineError::Remote("deployment task panicked".to_string()))
            }
        };

        ctx.finish(result).await;
    }

    /// 取消活跃运行
    pub async fn cancel(&self, app_id: &str, environment: Environment) -> bool {
        let target = DeployTarget::new(app_id, environment);
        let cancelled = self.runs.cancel(&target).await;
        if cancelled {
            info!(target = %target, "Deployment cancellation requested");
        }
        cancelled
    }

    /// 当前状态；从未运行过时为 Idle
    pub async fn status(&self, app_id: &str, environment: Environment) -> TargetStatus {
        self.runs.status(&DeployTarget::new(app_id, environment)).await
    }

    /// 历史记录（最新在前）
    pub async fn history(&self, limit: usize, app_id: Option<&str>) -> Vec<DeploymentRun> {
        self.runs.history(limit, app_id).await
    }
}

/// 在会话上执行各阶段
async fn run_pipeline(ctx: &DeployContext, session: Session) -> EngineResult<()> {
    let fs = RemoteFileSystem::new(&session)
        .with_cancel(ctx.cancel_token.clone())
        .with_transfer_timeout(ctx.config.step_timeout);
    let registry = ContainerRegistry::new(&session, ctx.config.docker_bin.clone());

    ctx.log_system("[1/4] Acquiring source...").await;
    let source = source::acquire(ctx, &session, &fs).await?;
    ctx.check_cancelled()?;

    ctx.transition(RunState::Building).await;
    ctx.log_system("[2/4] Building image...").await;
    let compose = registry.compose_flavor().await?;
    let built = build::build(ctx, &session, &fs, &compose, &source).await?;
    drop(source);
    ctx.check_cancelled()?;

    ctx.transition(RunState::RollingOut).await;
    ctx.log_system("[3/4] Rolling out...").await;
    rollout::rollout(ctx, &session, &fs, &registry, &compose, &built).await?;
    ctx.check_cancelled()?;

    ctx.transition(RunState::Verifying).await;
    ctx.log_system("[4/4] Verifying...").await;
    rollout::verify(ctx, &registry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::SshClientConfig;
    use crate::domain::app::tests::sample_app;
    use crate::domain::app::{BuildLocation, Source};
    use crate::domain::deploy::{FailureKind, StreamKind};
    use crate::domain::profile::Credential;
    use crate::error::ConcurrencyError;
    use crate::services::ssh::fake::{FakeConnector, FakeResponse, FakeShell};
    use crate::state::stream_hub::StreamEvent;
    use std::time::Duration;

    const RUNNING_CONTAINER: &str = r#"{"ID":"c1","Names":"a1-staging-app-1","Image":"a1-staging:latest","State":"running","Status":"Up 2 seconds","Labels":"com.docker.compose.project=a1-staging"}"#;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("10.0.0.5", "root", 22, Credential::Password("pw".into())).unwrap()
    }

    fn test_config() -> DeployConfig {
        DeployConfig {
            step_timeout: Duration::from_secs(5),
            health_grace: Duration::from_millis(300),
            verify_interval: Duration::from_millis(20),
            ..DeployConfig::default()
        }
    }

    /// 已有检出的远程仓库
    fn checked_out(shell: &FakeShell) {
        shell.on("rev-parse HEAD", FakeResponse::ok("3f2a9c1d\n"));
    }

    /// 健康的远程主机：首次部署走 clone，容器随后处于运行状态
    fn healthy_host(shell: &FakeShell) {
        shell.on_once("/.git ]", FakeResponse::exit(1, ""));
        checked_out(shell);
        shell.on("label=com.docker.compose.project=a1-staging", FakeResponse::ok(RUNNING_CONTAINER));
    }

    fn orchestrator(connector: Arc<FakeConnector>, config: DeployConfig) -> DeploymentOrchestrator {
        let connections = Arc::new(ConnectionManager::new(connector, SshClientConfig::default()));
        DeploymentOrchestrator::new(
            connections,
            Arc::new(RunStore::new()),
            Arc::new(StreamHub::new()),
            config,
        )
    }

    async fn wait_for_terminal(orch: &DeploymentOrchestrator, app_id: &str, env: Environment) -> TargetStatus {
        for _ in 0..500 {
            let status = orch.status(app_id, env).await;
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment did not finish");
    }

    async fn wait_for_state(orch: &DeploymentOrchestrator, app_id: &str, env: Environment, state: RunState) {
        for _ in 0..500 {
            if orch.status(app_id, env).await.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_staging_deploy_end_to_end() {
        let connector = FakeConnector::new(healthy_host);
        let orch = orchestrator(connector.clone(), test_config());
        let mut subscription = orch.hub.subscribe("deploy/a1/staging").await;

        let run = orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        assert_eq!(run.app_id, "a1");

        let status = wait_for_terminal(&orch, "a1", Environment::Staging).await;
        let finished = status.run.unwrap();
        assert_eq!(status.state, RunState::Succeeded, "{:?}", finished.exit_reason);
        assert_eq!(finished.commit.as_deref(), Some("3f2a9c1d"));

        let shell = connector.last_shell();
        assert!(shell.ran("git clone --branch dev --single-branch https://example.com/app.git /root/app-dev"));
        assert!(shell.ran("cd /root/app-dev && docker build -t a1-staging:latest ."));
        assert!(shell.ran(
            "cd /root/app-dev && docker compose -p a1-staging -f docker-compose.deploy.yml up -d --remove-orphans --force-recreate"
        ));
        // 生产环境的目录与容器命名空间不受影响
        assert!(!shell.commands().iter().any(|c| c.contains("/root/app ") || c.contains("a1-production")));

        let env_file = String::from_utf8(shell.stdin_for("/root/app-dev/.env.deploy").unwrap()).unwrap();
        assert_eq!(env_file, "PORT=8080\n");
        assert!(shell.ran("chmod 600"));

        let compose: serde_json::Value =
            serde_json::from_slice(&shell.stdin_for("docker-compose.deploy.yml").unwrap()).unwrap();
        let service = &compose["services"]["app"];
        assert_eq!(service["image"], "a1-staging:latest");
        assert_eq!(service["env_file"][0], ".env.deploy");
        assert_eq!(service["labels"]["deploy.environment"], "staging");

        let mut saw_progress = false;
        while let Some(event) = subscription.next().await {
            if let StreamEvent::Chunk(chunk) = event {
                assert_eq!(chunk.channel, "deploy/a1/staging");
                if chunk.stream == StreamKind::System && chunk.content.contains("[2/4]") {
                    saw_progress = true;
                }
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn test_second_deploy_rejected_while_running() {
        let connector = FakeConnector::new(|shell: &FakeShell| {
            checked_out(shell);
            shell.on("docker build", FakeResponse::hang());
        });
        let orch = orchestrator(connector, test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let err = orch
            .start(profile(), sample_app(), Environment::Staging)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Concurrency(ConcurrencyError::DeploymentAlreadyInProgress(_))
        ));

        // 另一个环境不受影响
        orch.start(profile(), sample_app(), Environment::Production).await.unwrap();

        assert!(orch.cancel("a1", Environment::Staging).await);
        assert!(orch.cancel("a1", Environment::Production).await);
        wait_for_terminal(&orch, "a1", Environment::Staging).await;
        wait_for_terminal(&orch, "a1", Environment::Production).await;
    }

    #[tokio::test]
    async fn test_cancel_during_build() {
        let connector = FakeConnector::new(|shell: &FakeShell| {
            checked_out(shell);
            shell.on("docker build", FakeResponse::hang());
        });
        let orch = orchestrator(connector.clone(), test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        wait_for_state(&orch, "a1", Environment::Staging, RunState::Building).await;
        // 等待 docker build 实际开始
        for _ in 0..200 {
            if connector.last_shell().ran("docker build") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(orch.cancel("a1", Environment::Staging).await);
        let status = wait_for_terminal(&orch, "a1", Environment::Staging).await;

        assert_eq!(status.state, RunState::Failed);
        let run = status.run.unwrap();
        assert_eq!(run.exit_reason.unwrap().kind, FailureKind::Cancelled);
        assert!(!run.stages.iter().any(|s| s.status == crate::domain::deploy::StageStatus::Running));
        assert!(connector
            .last_shell()
            .ran(&format!("kill -TERM -- -{}", FakeShell::PID)));

        // 取消后可以立即重新部署
        assert!(!orch.runs.is_active(&DeployTarget::new("a1", Environment::Staging)).await);
    }

    #[tokio::test]
    async fn test_repeated_deploy_converges_on_branch_tip() {
        let connector = FakeConnector::new(healthy_host);
        let orch = orchestrator(connector.clone(), test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let first = wait_for_terminal(&orch, "a1", Environment::Staging).await;
        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let second = wait_for_terminal(&orch, "a1", Environment::Staging).await;

        assert_eq!(first.state, RunState::Succeeded);
        assert_eq!(second.state, RunState::Succeeded);
        assert_eq!(first.run.unwrap().commit, second.run.as_ref().unwrap().commit);
        assert_ne!(
            orch.history(10, Some("a1")).await[0].id,
            orch.history(10, Some("a1")).await[1].id
        );

        // 会话被复用，第二次走 fetch 路径
        assert_eq!(connector.attempts(), 1);
        let commands = connector.last_shell().commands();
        assert_eq!(commands.iter().filter(|c| c.contains("git clone")).count(), 1);
        assert!(commands.iter().any(|c| c.contains(
            "git fetch --prune origin dev && git checkout -f -B dev origin/dev && git reset --hard origin/dev"
        )));
    }

    #[tokio::test]
    async fn test_health_check_timeout() {
        let connector = FakeConnector::new(|shell: &FakeShell| {
            checked_out(shell);
            shell.on(
                "label=com.docker.compose.project=a1-staging",
                FakeResponse::ok(
                    r#"{"ID":"c1","Names":"a1-staging-app-1","Image":"a1-staging:latest","State":"exited","Status":"Exited (1) 1 second ago"}"#,
                ),
            );
            shell.on("logs --tail", FakeResponse::ok("Error: listen EADDRINUSE\n"));
        });
        let orch = orchestrator(connector, test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let status = wait_for_terminal(&orch, "a1", Environment::Staging).await;

        let run = status.run.unwrap();
        assert_eq!(run.exit_reason.as_ref().unwrap().kind, FailureKind::HealthCheckTimeout);
        assert!(run.last_output.iter().any(|l| l.contains("EADDRINUSE")));
    }

    #[tokio::test]
    async fn test_missing_local_engine() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM scratch").unwrap();

        let mut app = sample_app();
        app.source = Source::LocalDirectory {
            path: source.path().to_path_buf(),
        };
        app.build_location = BuildLocation::Local;

        let config = DeployConfig {
            local_docker_bin: "/nonexistent/bin/docker".to_string(),
            ..test_config()
        };
        let connector = FakeConnector::new(|_: &FakeShell| {});
        let orch = orchestrator(connector.clone(), config);

        orch.start(profile(), app, Environment::Staging).await.unwrap();
        let status = wait_for_terminal(&orch, "a1", Environment::Staging).await;

        let run = status.run.unwrap();
        assert_eq!(run.exit_reason.unwrap().kind, FailureKind::LocalEngineUnavailable);
        // 源码已上传并解压
        let shell = connector.last_shell();
        assert!(shell.ran("tar -xzf"));
        assert!(!shell.ran("docker load"));
    }

    #[tokio::test]
    async fn test_remote_build_without_build_files() {
        let connector = FakeConnector::new(|shell: &FakeShell| {
            checked_out(shell);
            shell.on("/Dockerfile ]", FakeResponse::exit(1, ""));
        });
        let orch = orchestrator(connector, test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let run = wait_for_terminal(&orch, "a1", Environment::Staging).await.run.unwrap();
        assert_eq!(run.exit_reason.unwrap().kind, FailureKind::BuildCommandFailed);
    }

    #[tokio::test]
    async fn test_repository_compose_file_is_used() {
        let connector = FakeConnector::new(|shell: &FakeShell| {
            checked_out(shell);
            shell.on("for f in compose.yaml", FakeResponse::ok("docker-compose.yml\n"));
            shell.on("config --services", FakeResponse::ok("web\nworker\n"));
            shell.on("label=com.docker.compose.project=a1-staging", FakeResponse::ok(RUNNING_CONTAINER));
        });
        let orch = orchestrator(connector.clone(), test_config());

        orch.start(profile(), sample_app(), Environment::Staging).await.unwrap();
        let status = wait_for_terminal(&orch, "a1", Environment::Staging).await;
        assert_eq!(status.state, RunState::Succeeded);

        let shell = connector.last_shell();
        assert!(shell.ran("docker compose -p a1-staging -f docker-compose.yml build"));
        assert!(shell.ran(
            "docker compose -p a1-staging -f docker-compose.yml --env-file .env.deploy config --services"
        ));
        assert!(shell.ran(
            "-f docker-compose.yml -f docker-compose.deploy.env.yml --env-file .env.deploy up -d"
        ));
        assert!(shell.stdin_for("docker-compose.deploy.yml").is_none());

        // 每个服务的容器都拿到应用环境变量
        let overlay: serde_json::Value =
            serde_json::from_slice(&shell.stdin_for("docker-compose.deploy.env.yml").unwrap()).unwrap();
        assert_eq!(overlay["services"]["web"]["env_file"][0], ".env.deploy");
        assert_eq!(overlay["services"]["worker"]["env_file"][0], ".env.deploy");
    }

    #[tokio::test]
    async fn test_status_idle_before_first_run() {
        let orch = orchestrator(FakeConnector::new(|_: &FakeShell| {}), test_config());
        let status = orch.status("a1", Environment::Production).await;
        assert_eq!(status.state, RunState::Idle);
        assert!(status.run.is_none());
        assert!(!orch.cancel("a1", Environment::Production).await);
    }

    #[tokio::test]
    async fn test_invalid_app_rejected_before_run() {
        let orch = orchestrator(FakeConnector::new(|_: &FakeShell| {}), test_config());
        let mut app = sample_app();
        app.environments.staging.remote_path = "relative".to_string();
        let err = orch.start(profile(), app, Environment::Staging).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(orch.history(10, None).await.len(), 0);
    }
}
