//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::app::Environment;

/// 部署目标：(应用, 环境)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployTarget {
    pub app_id: String,
    pub environment: Environment,
}

impl DeployTarget {
    pub fn new(app_id: impl Into<String>, environment: Environment) -> Self {
        Self {
            app_id: app_id.into(),
            environment,
        }
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.environment)
    }
}

/// 部署状态机
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Acquiring,
    Building,
    RollingOut,
    Verifying,
    Succeeded,
    Failed,
}

impl RunState {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Acquiring => "acquiring",
            RunState::Building => "building",
            RunState::RollingOut => "rolling_out",
            RunState::Verifying => "verifying",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

/// 失败原因类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Timeout,
    ConnectionFailed,
    SourceAcquisitionFailed,
    LocalEngineUnavailable,
    BuildCommandFailed,
    RolloutFailed,
    HealthCheckTimeout,
    Internal,
}

/// 终止原因
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExitReason {
    pub kind: FailureKind,
    pub message: String,
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 对应的状态机状态
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl DeployStage {
    /// 创建新的待执行阶段
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 一次部署的运行记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: String,
    pub app_id: String,
    pub environment: Environment,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    /// 失败时最后的输出片段
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_output: Vec<String>,
    /// 部署的源码提交
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default)]
    pub stages: Vec<DeployStage>,
}

impl DeploymentRun {
    /// 创建新运行记录
    pub fn new(target: &DeployTarget) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: target.app_id.clone(),
            environment: target.environment,
            state: RunState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            exit_reason: None,
            last_output: Vec::new(),
            commit: None,
            stages: [
                RunState::Acquiring,
                RunState::Building,
                RunState::RollingOut,
                RunState::Verifying,
            ]
            .into_iter()
            .map(DeployStage::new)
            .collect(),
        }
    }

    pub fn target(&self) -> DeployTarget {
        DeployTarget::new(self.app_id.clone(), self.environment)
    }

    /// 进入新状态，同时结束上一阶段
    pub fn transition(&mut self, next: RunState) {
        if let Some(stage) = self.stages.iter_mut().find(|s| s.status == StageStatus::Running) {
            stage.finish(true, None);
        }
        if let Some(stage) = self.stages.iter_mut().find(|s| s.state == next) {
            stage.start();
        }
        self.state = next;
    }

    /// 成功结束
    pub fn succeed(&mut self) {
        self.transition(RunState::Succeeded);
        self.finished_at = Some(Utc::now());
    }

    /// 失败结束，未开始的阶段标记为跳过
    pub fn fail(&mut self, reason: ExitReason, last_output: Vec<String>) {
        for stage in self.stages.iter_mut() {
            match stage.status {
                StageStatus::Running => stage.finish(false, Some(reason.message.clone())),
                StageStatus::Pending => stage.skip(None),
                _ => {}
            }
        }
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.exit_reason = Some(reason);
        self.last_output = last_output;
    }
}

/// 目标当前状态（deploy.status 的返回值）
#[derive(Clone, Debug, Serialize)]
pub struct TargetStatus {
    pub app_id: String,
    pub environment: Environment,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<DeploymentRun>,
}

/// 输出流类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// 引擎自身的进度信息
    System,
}

/// 输出片段
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    pub timestamp: DateTime<Utc>,
    /// 所属通道（如 deploy/a1/staging）
    pub channel: String,
    pub stream: StreamKind,
    pub content: String,
}

impl StreamChunk {
    pub fn new(channel: impl Into<String>, stream: StreamKind, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: channel.into(),
            stream,
            content: content.into(),
        }
    }

    /// 片段占用的字节数
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_is_terminal() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Building.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new(RunState::Building);
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true, Some("Done".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_run_transitions_track_stages() {
        let target = DeployTarget::new("a1", Environment::Staging);
        let mut run = DeploymentRun::new(&target);
        run.transition(RunState::Acquiring);
        run.transition(RunState::Building);
        assert_eq!(run.stages[0].status, StageStatus::Success);
        assert_eq!(run.stages[1].status, StageStatus::Running);

        run.fail(
            ExitReason {
                kind: FailureKind::Cancelled,
                message: "cancelled".to_string(),
            },
            vec!["step 3/7".to_string()],
        );
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.stages[1].status, StageStatus::Failed);
        assert_eq!(run.stages[2].status, StageStatus::Skipped);
        assert_eq!(run.last_output, vec!["step 3/7".to_string()]);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(DeployTarget::new("a1", Environment::Production).to_string(), "a1/production");
    }
}
