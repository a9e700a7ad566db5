use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::engine::{EngineTaskState, EngineTaskStatus};

/// 下载任务（每条记录当前一次尝试，对应引擎中的一个任务）
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 所属记录
    pub record_key: String,
    /// 引擎任务句柄
    pub gid: String,
    /// 本次使用的链接
    pub link: String,
    /// 提交时间 (Unix timestamp)
    pub submitted_at: i64,
    /// 最近一次轮询到的引擎状态
    pub state: EngineTaskStatus,
    /// 文件大小
    pub total_size: u64,
    /// 已下载大小
    pub downloaded_size: u64,
    /// 最近一次轮询时间 (Unix timestamp)
    pub polled_at: Option<i64>,
}

impl DownloadTask {
    pub fn new(record_key: String, gid: String, link: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record_key,
            gid,
            link,
            submitted_at: chrono::Utc::now().timestamp(),
            state: EngineTaskStatus::Waiting,
            total_size: 0,
            downloaded_size: 0,
            polled_at: None,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.downloaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 记录轮询结果
    pub fn observe(&mut self, state: &EngineTaskState) {
        self.state = state.status;
        self.total_size = state.total_length;
        self.downloaded_size = state.completed_length;
        self.polled_at = Some(chrono::Utc::now().timestamp());
    }

    /// 磁力链接元数据任务完成后，切换到实际内容任务
    pub fn follow(&mut self, gid: String) {
        self.gid = gid;
        self.state = EngineTaskStatus::Waiting;
        self.total_size = 0;
        self.downloaded_size = 0;
    }
}

/// 下载产物
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileArtifact {
    pub record_key: String,
    pub path: PathBuf,
    pub size: u64,
}
