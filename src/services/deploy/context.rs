//! 部署上下文
//!
//! 统一的部署执行上下文，包含运行信息、输出通道、取消令牌等

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::DeployConfig;
use crate::domain::app::ApplicationConfig;
use crate::domain::deploy::{
    DeployTarget, DeploymentRun, ExitReason, FailureKind, RunState, StageStatus,
};
use crate::domain::fs::CommandOutput;
use crate::error::{BuildError, EngineError, EngineResult, ExecError, RolloutError};
use crate::infra::CommandError;
use crate::services::ssh::{ExclusiveGuard, ExecOptions, Session};
use crate::state::run_store::RunStore;
use crate::state::stream_hub::StreamSink;

/// 部署执行上下文
///
/// 封装部署过程中需要的所有状态和工具
#[derive(Clone)]
pub struct DeployContext {
    /// 运行 ID
    pub run_id: String,
    pub target: DeployTarget,
    pub app: ApplicationConfig,
    /// compose project 名称（`<appId>-<environment>`）
    pub project: String,
    pub runs: Arc<RunStore>,
    /// 输出通道 `deploy/<appId>/<environment>`
    pub sink: StreamSink,
    /// 取消令牌
    pub cancel_token: CancellationToken,
    pub config: DeployConfig,
}

impl DeployContext {
    pub fn new(
        run_id: String,
        target: DeployTarget,
        app: ApplicationConfig,
        runs: Arc<RunStore>,
        sink: StreamSink,
        cancel_token: CancellationToken,
        config: DeployConfig,
    ) -> Self {
        let project = app.compose_project(target.environment);
        Self {
            run_id,
            target,
            app,
            project,
            runs,
            sink,
            cancel_token,
            config,
        }
    }

    /// 当前环境的远程部署目录
    pub fn remote_path(&self) -> String {
        self.app.environment(self.target.environment).normalized_path()
    }

    /// 当前环境的分支
    pub fn branch(&self) -> String {
        self.app
            .environment(self.target.environment)
            .effective_branch(self.target.environment)
            .to_string()
    }

    /// 构建产物镜像名
    pub fn image(&self) -> String {
        format!("{}:latest", self.project)
    }

    /// 发送 stdout 日志
    pub async fn log_stdout(&self, content: impl Into<String>) {
        self.sink.stdout(content).await;
    }

    /// 发送 stderr 日志
    pub async fn log_stderr(&self, content: impl Into<String>) {
        self.sink.stderr(content).await;
    }

    /// 引擎进度信息
    pub async fn log_system(&self, content: impl Into<String>) {
        self.sink.system(content).await;
    }

    /// 进入新状态
    pub async fn transition(&self, next: RunState) {
        self.runs.transition(&self.target, next).await;
        info!(run_id = %self.run_id, target = %self.target, state = next.as_str(), "Deployment state changed");
    }

    /// 记录源码提交
    pub async fn set_commit(&self, commit: &str) {
        let commit = commit.trim().to_string();
        self.runs
            .update(&self.target, |run| run.commit = Some(commit))
            .await;
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 已取消时返回错误
    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            return Err(ExecError::Cancelled.into());
        }
        Ok(())
    }

    /// 执行远程命令，输出实时发布，使用步骤超时并响应取消
    pub async fn remote(&self, session: &Session, command: &str) -> EngineResult<CommandOutput> {
        self.log_system(format!(">>> {}", command)).await;
        let output = session
            .exec(
                command,
                ExecOptions::new()
                    .timeout(self.config.step_timeout)
                    .cancel(self.cancel_token.clone())
                    .sink(self.sink.clone()),
            )
            .await?;
        Ok(output)
    }

    /// 获取会话操作锁；等待期间响应取消
    pub async fn exclusive(&self, session: &Session) -> EngineResult<ExclusiveGuard> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(ExecError::Cancelled.into()),
            guard = session.exclusive() => Ok(guard),
        }
    }

    /// 完成运行：输出阶段汇总、关闭输出通道，最后写入终态
    ///
    /// 终态写入后同一目标可以立即开始下一次运行，此后不再向通道发布
    pub async fn finish(&self, result: EngineResult<()>) -> Option<DeploymentRun> {
        let failure = match result {
            Ok(()) => {
                self.log_system("=== Deployment Complete ===").await;
                None
            }
            Err(err) => {
                let state = self.runs.status(&self.target).await.state;
                let reason = failure_reason(&err, state, self.is_cancelled());
                self.log_stderr(format!("Deployment failed: {}", reason.message)).await;
                warn!(
                    run_id = %self.run_id,
                    target = %self.target,
                    state = state.as_str(),
                    error_kind = err.kind(),
                    error = %err,
                    "Deployment failed"
                );
                Some(reason)
            }
        };
        let last_output = self.sink.tail_lines();

        if let Some(mut preview) = self.runs.update(&self.target, |_| {}).await {
            match &failure {
                None => preview.succeed(),
                Some(reason) => preview.fail(reason.clone(), Vec::new()),
            }
            self.log_stage_summary(&preview).await;
        }
        self.sink.finish().await;

        let run = match failure {
            None => self.runs.succeed(&self.target).await,
            Some(reason) => self.runs.fail(&self.target, reason, last_output).await,
        };
        if let Some(run) = &run {
            info!(
                run_id = %self.run_id,
                target = %self.target,
                state = run.state.as_str(),
                commit = ?run.commit,
                "Deployment finished"
            );
        }
        run
    }

    async fn log_stage_summary(&self, run: &DeploymentRun) {
        self.log_system("").await;
        self.log_system("=== Stage Summary ===").await;
        for stage in &run.stages {
            let duration = stage
                .duration_ms
                .map(|d| format!("{}ms", d))
                .unwrap_or_else(|| "-".to_string());
            let status_icon = match stage.status {
                StageStatus::Success => "✓",
                StageStatus::Failed => "✗",
                StageStatus::Skipped => "⊘",
                StageStatus::Running => "⟳",
                StageStatus::Pending => "○",
            };
            self.log_system(format!("{} {} ({})", status_icon, stage.state.as_str(), duration))
                .await;
        }
    }
}

/// 失败原因：明确的错误类型优先，其余按失败时所处的状态归类
pub fn failure_reason(err: &EngineError, state: RunState, cancelled: bool) -> ExitReason {
    let kind = match err {
        _ if cancelled => FailureKind::Cancelled,
        EngineError::Exec(ExecError::Cancelled) => FailureKind::Cancelled,
        EngineError::Exec(ExecError::Timeout(_)) => FailureKind::Timeout,
        EngineError::Connect(_) => FailureKind::ConnectionFailed,
        EngineError::Build(BuildError::LocalEngineUnavailable(_)) => FailureKind::LocalEngineUnavailable,
        EngineError::Build(BuildError::BuildCommandFailed(_)) => FailureKind::BuildCommandFailed,
        EngineError::Rollout(RolloutError::HealthCheckTimeout(_)) => FailureKind::HealthCheckTimeout,
        EngineError::Rollout(RolloutError::ComposeFailed(_)) => FailureKind::RolloutFailed,
        _ => match state {
            RunState::Acquiring => FailureKind::SourceAcquisitionFailed,
            RunState::Building => FailureKind::BuildCommandFailed,
            RunState::RollingOut | RunState::Verifying => FailureKind::RolloutFailed,
            _ => FailureKind::Internal,
        },
    };

    let message = match kind {
        FailureKind::Cancelled => "deployment was cancelled".to_string(),
        _ => err.to_string(),
    };
    ExitReason { kind, message }
}

/// 本地命令错误转换为引擎错误
pub fn command_error(err: CommandError) -> EngineError {
    match err {
        CommandError::Cancelled => ExecError::Cancelled.into(),
        CommandError::Timeout(timeout) => ExecError::Timeout(timeout).into(),
        other => EngineError::Remote(other.to_string()),
    }
}
