// 下载引擎接口

pub mod aria2;

pub use aria2::Aria2Client;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// 引擎任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineTaskStatus {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
    /// 引擎不认识该任务（重启丢失或已被清理）
    Unknown,
}

impl EngineTaskStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "waiting" => Self::Waiting,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "removed" => Self::Removed,
            _ => Self::Unknown,
        }
    }

    /// 仍在引擎中进行
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Active | Self::Waiting | Self::Paused)
    }
}

/// 任务中的单个文件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineFile {
    pub path: PathBuf,
    pub length: u64,
}

/// 引擎返回的任务快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineTaskState {
    pub gid: String,
    pub status: EngineTaskStatus,
    pub total_length: u64,
    pub completed_length: u64,
    pub files: Vec<EngineFile>,
    pub error_message: Option<String>,
    /// 磁力链接元数据下载完成后，实际内容任务的 gid
    pub followed_by: Vec<String>,
}

impl EngineTaskState {
    pub fn unknown(gid: &str) -> Self {
        Self {
            gid: gid.to_string(),
            status: EngineTaskStatus::Unknown,
            total_length: 0,
            completed_length: 0,
            files: Vec::new(),
            error_message: None,
            followed_by: Vec::new(),
        }
    }

    /// 体积最大的文件（即影片本体）
    pub fn largest_file(&self) -> Option<&EngineFile> {
        self.files
            .iter()
            .filter(|f| !f.path.as_os_str().is_empty())
            .max_by_key(|f| f.length)
    }
}

/// 下载引擎
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// 提交下载，返回任务 gid
    async fn add_uri(&self, uri: &str, dir: &Path) -> Result<String>;

    /// 查询任务状态，未知任务返回 `EngineTaskStatus::Unknown`
    async fn tell_status(&self, gid: &str) -> Result<EngineTaskState>;

    /// 取消任务（任务不存在视为成功）
    async fn remove(&self, gid: &str) -> Result<()>;
}
