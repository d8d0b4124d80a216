//! 输出流 API
//!
//! GET /streams 列出通道，GET /streams/*channel 以 SSE 订阅（先 backlog 后实时）

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::stream_hub::{ChannelInfo, StreamEvent};
use crate::state::AppState;

/// 创建输出流路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/streams", get(list_channels))
        .route("/streams/*channel", get(stream_channel))
}

/// 通道列表
async fn list_channels(_auth: RequireApiKey, State(state): State<Arc<AppState>>) -> Json<Vec<ChannelInfo>> {
    Json(state.hub.channels().await)
}

/// 订阅通道
///
/// 事件：默认事件为 JSON 片段；`dropped` 报告落后丢弃的片段数；通道结束或引擎关闭时发送 `complete`
async fn stream_channel(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let channel = channel.trim_matches('/').to_string();
    if channel.is_empty() {
        return Err(ApiError::bad_request("channel must not be empty"));
    }

    // 已结束的通道只回放 backlog
    let already_finished = state.hub.exists(&channel).await && state.hub.is_finished(&channel).await;
    let mut subscription = state.hub.subscribe(&channel).await;
    if already_finished {
        subscription.backlog_only();
    }
    debug!(channel = %channel, replay_only = already_finished, "Stream subscriber attached");

    let shutdown = state.shutdown_token.clone();
    let stream = async_stream::stream! {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => None,
                event = subscription.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                StreamEvent::Chunk(chunk) => {
                    let json = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                StreamEvent::Dropped(n) => {
                    warn!(channel = %subscription.channel(), dropped = n, "Stream subscriber lagged");
                    yield Ok(Event::default().event("dropped").data(n.to_string()));
                }
            }
        }

        yield Ok(Event::default().event("complete").data(
            serde_json::json!({
                "channel": subscription.channel(),
                "dropped": subscription.dropped(),
            }).to_string()
        ));
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
