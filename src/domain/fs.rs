//! 远程文件系统领域模型

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// 目录项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    /// 解析 `find -printf '%y\t%s\t%T@\t%f\n'` 的一行
    pub fn parse_find_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '\t');
        let kind = parts.next()?;
        let size = parts.next()?.parse().unwrap_or(0);
        let mtime = parts.next()?;
        let name = parts.next()?;
        if name.is_empty() {
            return None;
        }

        let modified_at = mtime
            .split('.')
            .next()
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Some(Self {
            name: name.to_string(),
            size,
            is_directory: kind == "d",
            modified_at,
        })
    }
}

/// 按“目录在前，名称字典序”排序
pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// 远程命令输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
