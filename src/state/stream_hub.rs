//! 输出流广播中心
//!
//! 按通道（如 `deploy/a1/staging`）广播进程输出，每个通道保留有界 backlog，
//! 新订阅者先收到 backlog 再收到实时输出

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::config::env::constants::{STREAM_BACKLOG_BYTES, STREAM_SUBSCRIBER_CAPACITY};
use crate::domain::deploy::{StreamChunk, StreamKind};

/// 单个通道
struct StreamChannel {
    /// 广播发送者；finish 时替换，旧订阅者随之收到关闭
    sender: broadcast::Sender<StreamChunk>,
    backlog: VecDeque<StreamChunk>,
    /// backlog 当前字节数
    backlog_bytes: usize,
    created_at: DateTime<Utc>,
    finished: bool,
}

impl StreamChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            created_at: Utc::now(),
            finished: false,
        }
    }

    fn push_backlog(&mut self, chunk: StreamChunk, limit: usize) {
        self.backlog_bytes += chunk.len();
        self.backlog.push_back(chunk);
        while self.backlog_bytes > limit {
            match self.backlog.pop_front() {
                Some(old) => self.backlog_bytes -= old.len(),
                None => break,
            }
        }
    }
}

/// 通道概况
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscribers: usize,
    pub backlog_bytes: usize,
    pub finished: bool,
    pub created_at: DateTime<Utc>,
}

/// 订阅事件
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// 订阅者落后，最早的 n 个片段被丢弃
    Dropped(u64),
}

/// 订阅句柄
pub struct Subscription {
    channel: String,
    backlog: VecDeque<StreamChunk>,
    receiver: Option<broadcast::Receiver<StreamChunk>>,
    dropped: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 累计丢弃的片段数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// 只消费剩余 backlog，不再等待实时输出
    pub fn backlog_only(&mut self) {
        self.receiver = None;
    }

    /// 是否仍在接收
    pub fn is_active(&self) -> bool {
        self.receiver.is_some() || !self.backlog.is_empty()
    }

    /// 下一个事件：先消费 backlog，再等待实时输出
    ///
    /// 通道结束或已取消订阅时返回 None
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(chunk) = self.backlog.pop_front() {
            return Some(StreamEvent::Chunk(chunk));
        }

        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(chunk) => Some(StreamEvent::Chunk(chunk)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.dropped += n;
                Some(StreamEvent::Dropped(n))
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }
}

/// 输出流中心
pub struct StreamHub {
    channels: RwLock<HashMap<String, StreamChannel>>,
    /// 每个通道 backlog 字节上限
    backlog_limit: usize,
    /// 每个订阅者待投递队列长度
    subscriber_capacity: usize,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_limits(STREAM_BACKLOG_BYTES, STREAM_SUBSCRIBER_CAPACITY)
    }

    pub fn with_limits(backlog_limit: usize, subscriber_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            backlog_limit: backlog_limit.max(1),
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    /// 发布片段
    ///
    /// 写入 backlog 并广播；没有订阅者时只写 backlog。超过 backlog 上限的
    /// 单个片段只保留尾部
    pub async fn publish(&self, channel: &str, mut chunk: StreamChunk) {
        if chunk.len() > self.backlog_limit {
            chunk.content = tail_of(&chunk.content, self.backlog_limit).to_string();
        }

        let mut channels = self.channels.write().await;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(|| StreamChannel::new(self.subscriber_capacity));

        if entry.finished {
            // 新一轮输出：重新打开通道，backlog 保留
            entry.finished = false;
        }

        entry.push_backlog(chunk.clone(), self.backlog_limit);
        // 没有订阅者时 send 返回 Err，忽略
        let _ = entry.sender.send(chunk);
    }

    /// 订阅通道
    ///
    /// backlog 快照与接收者在同一把锁内获取，不会漏掉或重复片段
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.write().await;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(|| StreamChannel::new(self.subscriber_capacity));

        Subscription {
            channel: channel.to_string(),
            backlog: entry.backlog.clone(),
            receiver: Some(entry.sender.subscribe()),
            dropped: 0,
        }
    }

    /// 取消订阅（幂等）
    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        if subscription.receiver.take().is_some() {
            debug!(channel = %subscription.channel, "Stream subscriber detached");
        }
        subscription.backlog.clear();
    }

    /// 标记通道完成，当前订阅者收到结束
    pub async fn finish(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels.get_mut(channel) {
            entry.finished = true;
            let (sender, _) = broadcast::channel(self.subscriber_capacity);
            entry.sender = sender;
        }
    }

    pub async fn is_finished(&self, channel: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(channel).map_or(true, |c| c.finished)
    }

    pub async fn exists(&self, channel: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(channel)
    }

    /// 当前 backlog 字节数
    pub async fn backlog_bytes(&self, channel: &str) -> usize {
        let channels = self.channels.read().await;
        channels.get(channel).map_or(0, |c| c.backlog_bytes)
    }

    /// 通道列表
    pub async fn channels(&self) -> Vec<ChannelInfo> {
        let channels = self.channels.read().await;
        let mut list: Vec<ChannelInfo> = channels
            .iter()
            .map(|(name, c)| ChannelInfo {
                name: name.clone(),
                subscribers: c.sender.receiver_count(),
                backlog_bytes: c.backlog_bytes,
                finished: c.finished,
                created_at: c.created_at,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// 关闭全部通道，所有订阅者收到结束
    pub async fn finish_all(&self) {
        let mut channels = self.channels.write().await;
        for entry in channels.values_mut() {
            entry.finished = true;
            let (sender, _) = broadcast::channel(self.subscriber_capacity);
            entry.sender = sender;
        }
    }

    /// 清理没有订阅者的通道：已完成的，以及从未有输出的（只被订阅过的名字）
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, channel| {
            channel.sender.receiver_count() > 0 || (!channel.finished && !channel.backlog.is_empty())
        });
        let removed = before - channels.len();
        if removed > 0 {
            debug!(removed, "Removed idle stream channels");
        }
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 字符串末尾不超过 max 字节的部分（落在字符边界上）
fn tail_of(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// 绑定到某个通道的写入端
///
/// 可选地保留最后若干行输出，用于失败记录
#[derive(Clone)]
pub struct StreamSink {
    hub: Arc<StreamHub>,
    channel: String,
    tail: Option<Arc<Mutex<TailBuffer>>>,
}

struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StreamSink {
    pub fn new(hub: Arc<StreamHub>, channel: impl Into<String>) -> Self {
        Self {
            hub,
            channel: channel.into(),
            tail: None,
        }
    }

    /// 额外保留最后 `lines` 行输出
    pub fn with_tail(mut self, lines: usize) -> Self {
        self.tail = Some(Arc::new(Mutex::new(TailBuffer {
            lines: VecDeque::with_capacity(lines),
            capacity: lines.max(1),
        })));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, stream: StreamKind, content: impl Into<String>) {
        let content = content.into();
        if let Some(tail) = &self.tail {
            if let Ok(mut buffer) = tail.lock() {
                for line in content.lines() {
                    if buffer.lines.len() == buffer.capacity {
                        buffer.lines.pop_front();
                    }
                    buffer.lines.push_back(line.to_string());
                }
            }
        }
        self.hub
            .publish(&self.channel, StreamChunk::new(&self.channel, stream, content))
            .await;
    }

    pub async fn stdout(&self, line: impl Into<String>) {
        self.publish(StreamKind::Stdout, line).await;
    }

    pub async fn stderr(&self, line: impl Into<String>) {
        self.publish(StreamKind::Stderr, line).await;
    }

    /// 引擎自身的进度信息
    pub async fn system(&self, line: impl Into<String>) {
        self.publish(StreamKind::System, line).await;
    }

    /// 保留的最后几行输出
    pub fn tail_lines(&self) -> Vec<String> {
        self.tail
            .as_ref()
            .and_then(|tail| tail.lock().ok().map(|b| b.lines.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub async fn finish(&self) {
        self.hub.finish(&self.channel).await;
    }
}
