//! API Key 认证
//!
//! `RequireApiKey` extractor 校验 `x-api-key` header；
//! 浏览器 EventSource 无法设置 header，SSE 请求也可以使用 `?api_key=` 查询参数

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// API Key 认证 Extractor
///
/// ```ignore
/// async fn protected_handler(
///     _auth: RequireApiKey,
///     State(state): State<Arc<AppState>>,
/// ) -> impl IntoResponse {
///     // ...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query_key = parts.uri.query().and_then(query_api_key);
        verify_api_key(&parts.headers, query_key.as_deref(), &state.api_key)
    }
}

/// 验证 API Key：header 优先，其次查询参数
pub fn verify_api_key(
    headers: &HeaderMap,
    query_key: Option<&str>,
    expected_key: &str,
) -> Result<RequireApiKey, ApiError> {
    let provided_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or(query_key);

    match provided_key {
        Some(key) if !expected_key.is_empty() && key == expected_key => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}

/// 从查询字符串中取 `api_key`
fn query_api_key(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "api_key")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
