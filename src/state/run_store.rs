//! 部署运行存储
//!
//! 管理活跃运行和历史记录；每个 (应用, 环境) 同时最多一个活跃运行

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::MAX_RUN_HISTORY;
use crate::domain::deploy::{DeployTarget, DeploymentRun, ExitReason, RunState, TargetStatus};
use crate::error::ConcurrencyError;

/// 活跃运行
struct ActiveRun {
    run: DeploymentRun,
    cancel_token: CancellationToken,
}

/// 运行存储
pub struct RunStore {
    /// 活跃运行 (target -> run)
    active: RwLock<HashMap<DeployTarget, ActiveRun>>,
    /// 历史记录（最新在前）
    history: RwLock<VecDeque<DeploymentRun>>,
    max_history: usize,
    /// 历史保留时间
    retention: Duration,
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_config(MAX_RUN_HISTORY, 24 * 7)
    }

    /// 使用自定义配置创建
    pub fn with_config(max_history: usize, retention_hours: i64) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    /// 尝试开始一次运行
    ///
    /// 检查与插入在同一把写锁内完成；目标已有活跃运行时立即拒绝
    pub async fn try_begin(
        &self,
        target: &DeployTarget,
    ) -> Result<(DeploymentRun, CancellationToken), ConcurrencyError> {
        let mut active = self.active.write().await;
        if active.contains_key(target) {
            return Err(ConcurrencyError::DeploymentAlreadyInProgress(target.to_string()));
        }

        let run = DeploymentRun::new(target);
        let cancel_token = CancellationToken::new();
        active.insert(
            target.clone(),
            ActiveRun {
                run: run.clone(),
                cancel_token: cancel_token.clone(),
            },
        );
        Ok((run, cancel_token))
    }

    /// 更新活跃运行
    pub async fn update<F>(&self, target: &DeployTarget, f: F) -> Option<DeploymentRun>
    where
        F: FnOnce(&mut DeploymentRun),
    {
        let mut active = self.active.write().await;
        active.get_mut(target).map(|entry| {
            f(&mut entry.run);
            entry.run.clone()
        })
    }

    /// 进入新状态
    pub async fn transition(&self, target: &DeployTarget, next: RunState) {
        self.update(target, |run| run.transition(next)).await;
    }

    /// 成功结束并移入历史
    pub async fn succeed(&self, target: &DeployTarget) -> Option<DeploymentRun> {
        self.finish(target, |run| run.succeed()).await
    }

    /// 失败结束并移入历史
    pub async fn fail(
        &self,
        target: &DeployTarget,
        reason: ExitReason,
        last_output: Vec<String>,
    ) -> Option<DeploymentRun> {
        self.finish(target, |run| run.fail(reason, last_output)).await
    }

    async fn finish<F>(&self, target: &DeployTarget, f: F) -> Option<DeploymentRun>
    where
        F: FnOnce(&mut DeploymentRun),
    {
        let run = {
            let mut active = self.active.write().await;
            active.remove(target).map(|mut entry| {
                f(&mut entry.run);
                entry.run
            })
        };

        if let Some(run) = &run {
            self.add_to_history(run.clone()).await;
        }
        run
    }

    /// 添加到历史记录
    pub async fn add_to_history(&self, run: DeploymentRun) {
        let mut history = self.history.write().await;
        history.push_front(run);
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 取消活跃运行，返回是否存在
    pub async fn cancel(&self, target: &DeployTarget) -> bool {
        let active = self.active.read().await;
        match active.get(target) {
            Some(entry) => {
                entry.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部活跃运行（关闭服务时）
    pub async fn cancel_all(&self) {
        let active = self.active.read().await;
        for entry in active.values() {
            entry.cancel_token.cancel();
        }
    }

    /// 目标状态：活跃运行优先，其次最近一次历史；从未运行过为 Idle
    pub async fn status(&self, target: &DeployTarget) -> TargetStatus {
        let run = match self.active.read().await.get(target) {
            Some(entry) => Some(entry.run.clone()),
            None => {
                let history = self.history.read().await;
                history
                    .iter()
                    .find(|r| r.app_id == target.app_id && r.environment == target.environment)
                    .cloned()
            }
        };

        TargetStatus {
            app_id: target.app_id.clone(),
            environment: target.environment,
            state: run.as_ref().map_or(RunState::Idle, |r| r.state),
            run,
        }
    }

    pub async fn is_active(&self, target: &DeployTarget) -> bool {
        self.active.read().await.contains_key(target)
    }

    /// 是否有该应用的活跃运行
    pub async fn has_active_for_app(&self, app_id: &str) -> bool {
        self.active.read().await.keys().any(|t| t.app_id == app_id)
    }

    /// 获取活跃运行
    pub async fn active_runs(&self) -> Vec<DeploymentRun> {
        let active = self.active.read().await;
        active.values().map(|e| e.run.clone()).collect()
    }

    /// 获取历史记录
    pub async fn history(&self, limit: usize, app_id: Option<&str>) -> Vec<DeploymentRun> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|run| app_id.map_or(true, |id| run.app_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn history_count(&self) -> usize {
        self.history.read().await.len()
    }

    /// 清理超过保留时间的历史记录
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut history = self.history.write().await;
        history.retain(|run| run.finished_at.map_or(true, |t| t > cutoff));
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}
