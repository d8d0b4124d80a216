//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod commands;
pub mod health;
pub mod streams;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Commands
        .merge(commands::router())
        // Output streams
        .merge(streams::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::services::ssh::fake::{FakeConnector, FakeShell};
    use crate::state::CredentialStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let config = EnvConfig {
            api_key: "test-key".to_string(),
            data_dir: dir.to_path_buf(),
            ..EnvConfig::default()
        };
        let store = CredentialStore::open(dir).await.unwrap();
        Arc::new(AppState::with_connector(config, store, FakeConnector::new(|_: &FakeShell| {})))
    }

    async fn app(dir: &std::path::Path) -> Router {
        router(test_state(dir).await)
    }

    fn command(body: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/commands")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_commands_require_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(command(r#"{"command":"app.list"}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_command_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let response = app
            .clone()
            .oneshot(command(r#"{"command":"app.list"}"#, Some("test-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(command(r#"{"command":"deploy.rollback"}"#, Some("test-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // 未配置连接
        let response = app
            .clone()
            .oneshot(command(r#"{"command":"containers.list"}"#, Some("test-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(command(
                r#"{"command":"deploy.start","params":{"app_id":"missing","environment":"staging"}}"#,
                Some("test-key"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_ends_with_complete_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/streams/deploy/a1/staging")
                    .header("x-api-key", "test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.shutdown().await;
        let body = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream still open after shutdown")
        .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("event: complete"));
        assert!(body.contains("deploy/a1/staging"));
    }
}
