//! 远程容器与镜像管理
//!
//! 通过远程 docker CLI 查询与操作；状态按需拉取，不做推送

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::domain::container::{
    is_default_network, ContainerSnapshot, ImageSnapshot, LifecycleAction, RawContainer, RawImage,
    ReverseProxyInfo, COMPOSE_PROJECT_LABEL,
};
use crate::domain::fs::CommandOutput;
use crate::error::{EngineError, EngineResult, LifecycleError};
use crate::infra::shell_quote;
use crate::services::ssh::Session;

/// 反向代理识别关键字（镜像名或容器名包含）
const PROXY_KEYWORDS: &[&str] = &["traefik", "nginx-proxy-manager", "nginx-proxy", "caddy", "haproxy"];

/// 反向代理常用标签前缀
const PROXY_LABEL_PREFIXES: &[&str] = &["traefik.", "com.github.nginx-proxy.", "caddy"];

/// docker compose 调用方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeFlavor {
    /// `docker compose` 插件
    Plugin,
    /// 独立的 `docker-compose`
    Standalone,
}

impl ComposeFlavor {
    /// 命令前缀
    pub fn command(&self, docker_bin: &str) -> String {
        match self {
            ComposeFlavor::Plugin => format!("{} compose", docker_bin),
            ComposeFlavor::Standalone => "docker-compose".to_string(),
        }
    }
}

/// 容器注册表
pub struct ContainerRegistry<'a> {
    session: &'a Session,
    docker: String,
}

impl<'a> ContainerRegistry<'a> {
    pub fn new(session: &'a Session, docker_bin: impl Into<String>) -> Self {
        Self {
            session,
            docker: docker_bin.into(),
        }
    }

    /// 所有容器（含已停止）
    pub async fn list_containers(&self) -> EngineResult<Vec<ContainerSnapshot>> {
        let output = self
            .docker(&format!("ps -a --no-trunc --format {}", shell_quote("{{json .}}")))
            .await?;
        Ok(parse_json_lines::<RawContainer>(&output.stdout)
            .into_iter()
            .map(ContainerSnapshot::from)
            .collect())
    }

    /// 所有镜像
    pub async fn list_images(&self) -> EngineResult<Vec<ImageSnapshot>> {
        let output = self
            .docker(&format!("images --format {}", shell_quote("{{json .}}")))
            .await?;
        Ok(parse_json_lines::<RawImage>(&output.stdout)
            .into_iter()
            .map(ImageSnapshot::from)
            .collect())
    }

    /// 某个 compose project 的容器
    pub async fn project_containers(&self, project: &str) -> EngineResult<Vec<ContainerSnapshot>> {
        let filter = format!("label={}={}", COMPOSE_PROJECT_LABEL, project);
        let output = self
            .docker(&format!(
                "ps -a --no-trunc --filter {} --format {}",
                shell_quote(&filter),
                shell_quote("{{json .}}")
            ))
            .await?;
        Ok(parse_json_lines::<RawContainer>(&output.stdout)
            .into_iter()
            .map(ContainerSnapshot::from)
            .collect())
    }

    /// 容器是否在运行；不存在时返回 ContainerNotFound
    async fn is_running(&self, container_id: &str) -> EngineResult<bool> {
        let output = self
            .run(&format!(
                "{} inspect -f {} {}",
                self.docker,
                shell_quote("{{.State.Running}}"),
                shell_quote(container_id)
            ))
            .await?;
        if !output.success() {
            return Err(container_error(&output, container_id));
        }
        Ok(output.stdout.trim() == "true")
    }

    /// 生命周期操作
    ///
    /// 删除运行中的容器需要 `force`
    pub async fn lifecycle(&self, container_id: &str, action: LifecycleAction, force: bool) -> EngineResult<()> {
        let running = self.is_running(container_id).await?;
        let id = shell_quote(container_id);

        let command = match action {
            LifecycleAction::Start => format!("{} start {}", self.docker, id),
            LifecycleAction::Stop => format!("{} stop {}", self.docker, id),
            LifecycleAction::Restart => format!("{} restart {}", self.docker, id),
            LifecycleAction::Remove => {
                if running && !force {
                    return Err(LifecycleError::ContainerRunning(container_id.to_string()).into());
                }
                if force {
                    format!("{} rm -f {}", self.docker, id)
                } else {
                    format!("{} rm {}", self.docker, id)
                }
            }
        };

        let output = self.run(&command).await?;
        if !output.success() {
            return Err(container_error(&output, container_id));
        }

        info!(container = %container_id, action = action.as_str(), force, "Container lifecycle action applied");
        Ok(())
    }

    /// 删除镜像；仍被容器引用时拒绝
    pub async fn remove_image(&self, image_id: &str) -> EngineResult<()> {
        let users = self
            .docker(&format!(
                "ps -a -q --filter {}",
                shell_quote(&format!("ancestor={}", image_id))
            ))
            .await?;
        if !users.stdout.trim().is_empty() {
            return Err(LifecycleError::ImageInUse(image_id.to_string()).into());
        }

        let output = self
            .run(&format!("{} rmi {}", self.docker, shell_quote(image_id)))
            .await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            if stderr.contains("No such image") {
                return Err(EngineError::NotFound(format!("image '{}'", image_id)));
            }
            if stderr.contains("being used") || stderr.contains("is using its referenced image") {
                return Err(LifecycleError::ImageInUse(image_id.to_string()).into());
            }
            return Err(LifecycleError::CommandFailed(stderr.to_string()).into());
        }

        info!(image = %image_id, "Image removed");
        Ok(())
    }

    /// 最近 `tail` 行日志（stdout 与 stderr 合并）
    pub async fn container_logs(&self, container_id: &str, tail: usize) -> EngineResult<Vec<String>> {
        let output = self
            .run(&format!(
                "{} logs --tail {} {} 2>&1",
                self.docker,
                tail,
                shell_quote(container_id)
            ))
            .await?;
        if !output.success() {
            // 合并输出后错误信息在 stdout
            let merged = CommandOutput {
                stderr: output.stdout.clone(),
                ..output
            };
            return Err(container_error(&merged, container_id));
        }
        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    /// 查找运行中的反向代理及其网络
    pub async fn detect_reverse_proxy(&self) -> EngineResult<ReverseProxyInfo> {
        let containers = self.list_containers().await?;
        let proxy = containers
            .iter()
            .filter(|c| c.is_running())
            .filter_map(|c| proxy_rank(c).map(|rank| (rank, c)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, c)| c);

        let Some(proxy) = proxy else {
            return Ok(ReverseProxyInfo::default());
        };

        let output = self
            .run(&format!(
                "{} inspect -f {} {}",
                self.docker,
                shell_quote("{{json .NetworkSettings.Networks}}"),
                shell_quote(&proxy.name)
            ))
            .await?;

        let networks = if output.success() {
            match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(output.stdout.trim()) {
                Ok(map) => map.into_keys().collect(),
                Err(e) => {
                    warn!(container = %proxy.name, error = %e, "Unparseable network settings");
                    proxy.networks.clone()
                }
            }
        } else {
            proxy.networks.clone()
        };

        info!(container = %proxy.name, networks = ?networks, "Reverse proxy detected");
        Ok(ReverseProxyInfo {
            found: true,
            container_name: Some(proxy.name.clone()),
            networks: order_networks(networks),
        })
    }

    /// 远程 compose 调用方式：优先插件，其次独立命令
    pub async fn compose_flavor(&self) -> EngineResult<ComposeFlavor> {
        if self.docker("compose version").await.is_ok() {
            return Ok(ComposeFlavor::Plugin);
        }
        let output = self.run("docker-compose version").await?;
        if output.success() {
            return Ok(ComposeFlavor::Standalone);
        }
        Err(LifecycleError::CommandFailed(
            "neither 'docker compose' nor 'docker-compose' is available on the remote host".to_string(),
        )
        .into())
    }

    /// 执行 docker 子命令，非零退出码视为失败
    async fn docker(&self, args: &str) -> EngineResult<CommandOutput> {
        let output = self.run(&format!("{} {}", self.docker, args)).await?;
        if !output.success() {
            return Err(LifecycleError::CommandFailed(output.stderr.trim().to_string()).into());
        }
        Ok(output)
    }

    async fn run(&self, command: &str) -> EngineResult<CommandOutput> {
        Ok(self.session.run(command).await?)
    }
}

/// 非零退出码的容器命令错误
fn container_error(output: &CommandOutput, container_id: &str) -> EngineError {
    let stderr = output.stderr.trim();
    if stderr.contains("No such container") || stderr.contains("No such object") {
        LifecycleError::ContainerNotFound(container_id.to_string()).into()
    } else {
        LifecycleError::CommandFailed(stderr.to_string()).into()
    }
}

/// 逐行解析 `--format '{{json .}}'` 输出，跳过无法解析的行
fn parse_json_lines<T: for<'de> Deserialize<'de>>(stdout: &str) -> Vec<T> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, line = %line, "Skipping unparseable docker output");
                None
            }
        })
        .collect()
}

/// 反向代理匹配优先级，越小越优先；不是代理返回 None
fn proxy_rank(container: &ContainerSnapshot) -> Option<usize> {
    let image = container.image.to_lowercase();
    let name = container.name.to_lowercase();
    PROXY_KEYWORDS
        .iter()
        .position(|kw| image.contains(kw) || name.contains(kw))
        .or_else(|| {
            container
                .labels
                .keys()
                .any(|key| PROXY_LABEL_PREFIXES.iter().any(|p| key.starts_with(p)))
                // 只带路由标签的普通服务容器也会有 traefik.* 标签，排在关键字匹配之后
                .then_some(PROXY_KEYWORDS.len())
        })
}

/// 用户自定义网络在前（按名称），默认网络在后
fn order_networks(mut networks: Vec<String>) -> Vec<String> {
    networks.sort_by(|a, b| {
        is_default_network(a)
            .cmp(&is_default_network(b))
            .then_with(|| a.cmp(b))
    });
    networks.dedup();
    networks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::fake::{FakeResponse, FakeShell};
    use std::sync::Arc;
    use std::time::Duration;

    const PS_OUTPUT: &str = concat!(
        r#"{"ID":"c1","Names":"traefik","Image":"traefik:v3.0","State":"running","Status":"Up 3 days","Labels":"","Networks":"bridge,web"}"#,
        "\n",
        r#"{"ID":"c2","Names":"a1-staging-app","Image":"a1-staging:latest","State":"running","Status":"Up 1 minute","Labels":"com.docker.compose.project=a1-staging,traefik.enable=true","Networks":"web"}"#,
        "\n",
        r#"{"ID":"c3","Names":"old","Image":"busybox","State":"exited","Status":"Exited (0) 1 day ago","Labels":"","Networks":""}"#,
        "\n"
    );

    fn session(shell: Arc<FakeShell>) -> Session {
        Session::new(shell, "fp", "root@h:22", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_list_containers_parses_json_lines() {
        let shell = FakeShell::new();
        shell.on("docker ps -a --no-trunc --format", FakeResponse::ok(PS_OUTPUT));
        let session = session(shell);

        let containers = ContainerRegistry::new(&session, "docker").list_containers().await.unwrap();
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[1].compose_project.as_deref(), Some("a1-staging"));
        assert!(!containers[2].is_running());
    }

    #[tokio::test]
    async fn test_list_images() {
        let shell = FakeShell::new();
        shell.on(
            "docker images",
            FakeResponse::ok(concat!(
                r#"{"ID":"sha1","Repository":"a1-staging","Tag":"latest","Size":"120MB","CreatedAt":"2024-05-01"}"#,
                "\nnot json\n"
            )),
        );
        let session = session(shell);

        let images = ContainerRegistry::new(&session, "docker").list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].repository, "a1-staging");
    }

    #[tokio::test]
    async fn test_remove_running_container_requires_force() {
        let shell = FakeShell::new();
        shell.on("inspect -f", FakeResponse::ok("true\n"));
        let session = session(shell.clone());
        let registry = ContainerRegistry::new(&session, "docker");

        let err = registry.lifecycle("c2", LifecycleAction::Remove, false).await.unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(LifecycleError::ContainerRunning(_))));
        assert!(!shell.ran("docker rm"));

        registry.lifecycle("c2", LifecycleAction::Remove, true).await.unwrap();
        assert!(shell.ran("docker rm -f c2"));
    }

    #[tokio::test]
    async fn test_lifecycle_unknown_container() {
        let shell = FakeShell::new();
        shell.on("inspect -f", FakeResponse::exit(1, "Error: No such object: nope"));
        let session = session(shell);

        let err = ContainerRegistry::new(&session, "docker")
            .lifecycle("nope", LifecycleAction::Start, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(LifecycleError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_image_in_use() {
        let shell = FakeShell::new();
        shell.on("ancestor=sha1", FakeResponse::ok("c2\n"));
        let session = session(shell.clone());

        let err = ContainerRegistry::new(&session, "docker").remove_image("sha1").await.unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(LifecycleError::ImageInUse(_))));
        assert!(!shell.ran("rmi"));
    }

    #[tokio::test]
    async fn test_remove_unused_image() {
        let shell = FakeShell::new();
        let session = session(shell.clone());
        ContainerRegistry::new(&session, "docker").remove_image("sha9").await.unwrap();
        assert!(shell.ran("docker rmi sha9"));
    }

    #[tokio::test]
    async fn test_detect_reverse_proxy_orders_networks() {
        let shell = FakeShell::new();
        shell.on("docker ps -a --no-trunc --format", FakeResponse::ok(PS_OUTPUT));
        shell.on(
            "NetworkSettings.Networks",
            FakeResponse::ok(r#"{"bridge":{},"web":{},"proxy-net":{}}"#),
        );
        let session = session(shell);

        let info = ContainerRegistry::new(&session, "docker").detect_reverse_proxy().await.unwrap();
        assert!(info.found);
        assert_eq!(info.container_name.as_deref(), Some("traefik"));
        assert_eq!(info.networks, vec!["proxy-net", "web", "bridge"]);
        assert_eq!(info.recommended_network(), Some("proxy-net"));
    }

    #[tokio::test]
    async fn test_no_reverse_proxy() {
        let shell = FakeShell::new();
        shell.on(
            "docker ps",
            FakeResponse::ok(r#"{"ID":"c3","Names":"db","Image":"postgres:16","State":"running","Status":"Up"}"#),
        );
        let session = session(shell);

        let info = ContainerRegistry::new(&session, "docker").detect_reverse_proxy().await.unwrap();
        assert!(!info.found);
        assert!(info.networks.is_empty());
    }

    #[tokio::test]
    async fn test_compose_flavor_fallback() {
        let shell = FakeShell::new();
        shell.on("docker compose version", FakeResponse::exit(1, "unknown command"));
        shell.on("docker-compose version", FakeResponse::ok("docker-compose version 1.29.2"));
        let session = session(shell);

        let flavor = ContainerRegistry::new(&session, "docker").compose_flavor().await.unwrap();
        assert_eq!(flavor, ComposeFlavor::Standalone);
        assert_eq!(flavor.command("docker"), "docker-compose");
    }

    #[tokio::test]
    async fn test_container_logs() {
        let shell = FakeShell::new();
        shell.on("logs --tail 2", FakeResponse::ok("line 1\nline 2\n"));
        let session = session(shell);

        let lines = ContainerRegistry::new(&session, "docker")
            .container_logs("c2", 2)
            .await
            .unwrap();
        assert_eq!(lines, vec!["line 1", "line 2"]);
    }

    #[test]
    fn test_proxy_rank_prefers_keyword_over_labels() {
        let proxy = ContainerSnapshot {
            id: "1".into(),
            name: "edge".into(),
            image: "jc21/nginx-proxy-manager:latest".into(),
            status: "Up".into(),
            state: "running".into(),
            created_at: String::new(),
            ports: vec![],
            labels: BTreeMap::new(),
            networks: vec![],
            compose_project: None,
        };
        let labelled = ContainerSnapshot {
            name: "api".into(),
            image: "api:latest".into(),
            labels: BTreeMap::from([("traefik.enable".to_string(), "true".to_string())]),
            ..proxy.clone()
        };
        assert!(proxy_rank(&proxy).unwrap() < proxy_rank(&labelled).unwrap());
    }
}
