//! 发布与验证（RollingOut / Verifying 阶段）

use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use super::build::BuildOutcome;
use super::context::DeployContext;
use crate::error::{EngineResult, ExecError, RolloutError};
use crate::infra::shell_quote;
use crate::services::containers::{ComposeFlavor, ContainerRegistry};
use crate::services::remote_fs::RemoteFileSystem;
use crate::services::ssh::Session;

/// 注入容器的环境变量文件
pub const ENV_FILE_NAME: &str = ".env.deploy";

/// 没有仓库 compose 文件时生成的 compose 文件
pub const GENERATED_COMPOSE_FILE: &str = "docker-compose.deploy.yml";

/// 仓库 compose 文件的覆盖文件，为每个服务注入环境变量文件
pub const ENV_OVERRIDE_FILE: &str = "docker-compose.deploy.env.yml";

/// 生成 compose 中的服务名
const SERVICE_NAME: &str = "app";

/// 失败诊断时输出的容器日志行数
const DIAGNOSTIC_LOG_LINES: usize = 20;

/// 写入环境变量与 compose 文件，然后 `compose up`
pub async fn rollout(
    ctx: &DeployContext,
    session: &Session,
    fs: &RemoteFileSystem<'_>,
    registry: &ContainerRegistry<'_>,
    compose: &ComposeFlavor,
    build: &BuildOutcome,
) -> EngineResult<()> {
    // 网络探测只读，放在操作锁之外
    let network = match &build.compose_file {
        Some(_) => None,
        None => resolve_network(ctx, registry).await,
    };

    let _guard = ctx.exclusive(session).await?;
    let path = ctx.remote_path();

    let env_vars = &ctx.app.environment(ctx.target.environment).env_vars;
    fs.write_file(&format!("{}/{}", path, ENV_FILE_NAME), render_env_file(env_vars).as_bytes(), 0o600)
        .await?;
    ctx.log_system(format!("Wrote {} ({} variables)", ENV_FILE_NAME, env_vars.len()))
        .await;

    let compose_args = match &build.compose_file {
        Some(file) => {
            let base = format!("-f {} --env-file {}", shell_quote(file), ENV_FILE_NAME);
            let services = list_services(ctx, session, compose, &path, &base).await?;
            if services.is_empty() {
                base
            } else {
                let content = render_env_override(&services);
                fs.write_file(&format!("{}/{}", path, ENV_OVERRIDE_FILE), content.as_bytes(), 0o644)
                    .await?;
                ctx.log_system(format!(
                    "Wrote {} ({} services)",
                    ENV_OVERRIDE_FILE,
                    services.len()
                ))
                .await;
                format!(
                    "-f {} -f {} --env-file {}",
                    shell_quote(file),
                    ENV_OVERRIDE_FILE,
                    ENV_FILE_NAME
                )
            }
        }
        None => {
            let content = render_compose_file(ctx, network.as_deref());
            fs.write_file(&format!("{}/{}", path, GENERATED_COMPOSE_FILE), content.as_bytes(), 0o644)
                .await?;
            ctx.log_system(format!("Wrote {}", GENERATED_COMPOSE_FILE)).await;
            format!("-f {}", GENERATED_COMPOSE_FILE)
        }
    };

    let command = format!(
        "cd {} && {} -p {} {} up -d --remove-orphans --force-recreate",
        shell_quote(&path),
        compose.command(&ctx.config.docker_bin),
        shell_quote(&ctx.project),
        compose_args
    );
    let output = ctx.remote(session, &command).await?;
    if !output.success() {
        let detail = output
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .to_string();
        return Err(RolloutError::ComposeFailed(format!("exit {}: {}", output.exit_code, detail)).into());
    }

    info!(run_id = %ctx.run_id, project = %ctx.project, "Compose project started");
    Ok(())
}

/// 仓库 compose 文件中定义的服务
async fn list_services(
    ctx: &DeployContext,
    session: &Session,
    compose: &ComposeFlavor,
    path: &str,
    compose_args: &str,
) -> EngineResult<Vec<String>> {
    let command = format!(
        "cd {} && {} -p {} {} config --services",
        shell_quote(path),
        compose.command(&ctx.config.docker_bin),
        shell_quote(&ctx.project),
        compose_args
    );
    let output = ctx.remote(session, &command).await?;
    if !output.success() {
        return Err(RolloutError::ComposeFailed(format!(
            "compose config exited with code {}: {}",
            output.exit_code,
            output.stderr.trim()
        ))
        .into());
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// 轮询 project 的容器，直到至少一个处于运行状态
pub async fn verify(ctx: &DeployContext, registry: &ContainerRegistry<'_>) -> EngineResult<()> {
    let grace = ctx.config.health_grace;
    let started = Instant::now();
    ctx.log_system(format!("Waiting up to {:?} for a running container", grace))
        .await;

    loop {
        ctx.check_cancelled()?;
        let containers = registry.project_containers(&ctx.project).await?;
        if let Some(running) = containers.iter().find(|c| c.is_running()) {
            ctx.log_system(format!("Container {} is {} ({})", running.name, running.state, running.status))
                .await;
            return Ok(());
        }

        if started.elapsed() >= grace {
            ctx.log_stderr(format!("No running container for {} after {:?}", ctx.project, grace))
                .await;
            for container in &containers {
                ctx.log_stderr(format!("{}: {}", container.name, container.status)).await;
                match registry.container_logs(&container.id, DIAGNOSTIC_LOG_LINES).await {
                    Ok(lines) => {
                        for line in lines {
                            ctx.log_stderr(line).await;
                        }
                    }
                    Err(e) => warn!(container = %container.name, error = %e, "Cannot read container logs"),
                }
            }
            return Err(RolloutError::HealthCheckTimeout(grace).into());
        }

        tokio::select! {
            _ = ctx.cancel_token.cancelled() => return Err(ExecError::Cancelled.into()),
            _ = tokio::time::sleep(ctx.config.verify_interval) => {}
        }
    }
}

/// 显式配置的网络优先，其次反向代理推荐的网络
async fn resolve_network(ctx: &DeployContext, registry: &ContainerRegistry<'_>) -> Option<String> {
    if let Some(network) = ctx.app.network.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        return Some(network.to_string());
    }

    match registry.detect_reverse_proxy().await {
        Ok(proxy) => {
            let network = proxy.recommended_network().map(str::to_string);
            match (&proxy.container_name, &network) {
                (Some(name), Some(net)) => {
                    ctx.log_system(format!("Attaching to network {} of reverse proxy {}", net, name))
                        .await
                }
                (Some(name), None) => {
                    ctx.log_system(format!("Reverse proxy {} only uses default networks", name))
                        .await
                }
                _ => ctx.log_system("No reverse proxy detected").await,
            }
            network
        }
        Err(e) => {
            warn!(run_id = %ctx.run_id, error = %e, "Reverse proxy detection failed");
            None
        }
    }
}

/// `KEY=value` 每行一个
///
/// 值按 compose 环境变量文件规则加引号：单引号内不做插值，
/// 含单引号的值使用双引号并转义 `\`、`"`，`$` 写成 `$$`
pub fn render_env_file(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(key, value)| format!("{}={}\n", key, quote_env_value(value)))
        .collect()
}

fn quote_env_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:,@+=%".contains(c));
    if plain {
        return value.to_string();
    }
    if !value.contains('\'') {
        return format!("'{}'", value);
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "$$");
    format!("\"{}\"", escaped)
}

/// 为每个服务追加 `env_file`
pub fn render_env_override(services: &[String]) -> String {
    let mut document = json!({ "services": {} });
    for service in services {
        document["services"][service.as_str()] = json!({ "env_file": [ENV_FILE_NAME] });
    }
    let mut rendered = serde_json::to_string_pretty(&document).unwrap_or_default();
    rendered.push('\n');
    rendered
}

/// 生成单服务 compose 文件
///
/// 输出为 JSON，compose 按 YAML 解析时同样有效
pub fn render_compose_file(ctx: &DeployContext, network: Option<&str>) -> String {
    let mut service = json!({
        "image": ctx.image(),
        "restart": "unless-stopped",
        "env_file": [ENV_FILE_NAME],
        "labels": {
            "deploy.app": ctx.target.app_id,
            "deploy.environment": ctx.target.environment.as_str(),
        },
    });

    let mut document = json!({ "services": {} });
    if let Some(network) = network {
        service["networks"] = json!([network]);
        document["networks"] = json!({
            network: { "external": true, "name": network },
        });
    }
    document["services"][SERVICE_NAME] = service;

    let mut rendered = serde_json::to_string_pretty(&document).unwrap_or_default();
    rendered.push('\n');
    rendered
}
