//! 容器相关领域模型

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// compose 写入容器的 project 标签
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// 容器快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    /// running / exited / created / paused ...
    pub state: String,
    pub created_at: String,
    pub ports: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_project: Option<String>,
}

impl ContainerSnapshot {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// `docker ps --format '{{json .}}'` 的单行输出
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawContainer {
    #[serde(rename = "ID")]
    pub id: String,
    pub names: String,
    pub image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub labels: String,
    #[serde(default)]
    pub networks: String,
}

impl From<RawContainer> for ContainerSnapshot {
    fn from(raw: RawContainer) -> Self {
        let labels = parse_labels(&raw.labels);
        let compose_project = labels.get(COMPOSE_PROJECT_LABEL).cloned();
        // 旧版本 docker 没有 State 字段，从 Status 推断
        let state = raw.state.filter(|s| !s.is_empty()).unwrap_or_else(|| {
            if raw.status.starts_with("Up") {
                "running".to_string()
            } else {
                "exited".to_string()
            }
        });

        Self {
            id: raw.id,
            name: raw.names.split(',').next().unwrap_or_default().to_string(),
            image: raw.image,
            status: raw.status,
            state,
            created_at: raw.created_at,
            ports: split_list(&raw.ports),
            labels,
            networks: split_list(&raw.networks),
            compose_project,
        }
    }
}

/// 镜像快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSnapshot {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub size: String,
    pub created_at: String,
}

/// `docker images --format '{{json .}}'` 的单行输出
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawImage {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub created_at: String,
}

impl From<RawImage> for ImageSnapshot {
    fn from(raw: RawImage) -> Self {
        Self {
            id: raw.id,
            repository: raw.repository,
            tag: raw.tag,
            size: raw.size,
            created_at: raw.created_at,
        }
    }
}

/// 容器生命周期操作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    Remove,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Remove => "remove",
        }
    }
}

/// 反向代理探测结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReverseProxyInfo {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// 推荐网络在前，默认网络在后
    pub networks: Vec<String>,
}

impl ReverseProxyInfo {
    /// 推荐给新应用的共享网络
    pub fn recommended_network(&self) -> Option<&str> {
        self.networks
            .first()
            .map(String::as_str)
            .filter(|n| !is_default_network(n))
    }
}

/// docker 内置网络
pub fn is_default_network(name: &str) -> bool {
    matches!(name, "bridge" | "host" | "none")
}

/// 解析 `a=b,c=d` 形式的标签
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_from_docker_json() {
        let line = r#"{"Command":"\"node app\"","CreatedAt":"2024-05-01 10:00:00 +0000 UTC","ID":"abc123","Image":"a1-staging:latest","Labels":"com.docker.compose.project=a1-staging,deploy.app=a1","Names":"a1-staging-app","Networks":"proxy,a1-staging_default","Ports":"0.0.0.0:8080->8080/tcp","State":"running","Status":"Up 2 minutes"}"#;
        let raw: RawContainer = serde_json::from_str(line).unwrap();
        let snapshot = ContainerSnapshot::from(raw);

        assert_eq!(snapshot.name, "a1-staging-app");
        assert!(snapshot.is_running());
        assert_eq!(snapshot.compose_project.as_deref(), Some("a1-staging"));
        assert_eq!(snapshot.networks, vec!["proxy", "a1-staging_default"]);
        assert_eq!(snapshot.labels.get("deploy.app").map(String::as_str), Some("a1"));
    }

    #[test]
    fn test_container_state_inferred_from_status() {
        let line = r#"{"ID":"x","Names":"old","Image":"i","Status":"Exited (0) 3 hours ago"}"#;
        let snapshot = ContainerSnapshot::from(serde_json::from_str::<RawContainer>(line).unwrap());
        assert_eq!(snapshot.state, "exited");
    }

    #[test]
    fn test_recommended_network_skips_defaults() {
        let info = ReverseProxyInfo {
            found: true,
            container_name: Some("traefik".into()),
            networks: vec!["bridge".into()],
        };
        assert_eq!(info.recommended_network(), None);

        let info = ReverseProxyInfo {
            found: true,
            container_name: Some("traefik".into()),
            networks: vec!["web".into(), "bridge".into()],
        };
        assert_eq!(info.recommended_network(), Some("web"));
    }
}
