// 影片目录数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =====================================================
// 下载链接
// =====================================================

/// 链接传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// 磁力链接
    Magnet,
    /// 协议专用链接（thunder://，提交前解码为内部地址）
    Protocol,
    /// FTP 链接
    Ftp,
}

impl LinkKind {
    /// 根据链接前缀识别类型，不支持的返回 None
    pub fn detect(url: &str) -> Option<Self> {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("magnet:?") {
            Some(Self::Magnet)
        } else if lower.starts_with("ftp://") {
            Some(Self::Ftp)
        } else if lower.starts_with("thunder://") {
            Some(Self::Protocol)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Magnet => "magnet",
            Self::Protocol => "protocol",
            Self::Ftp => "ftp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "magnet" => Some(Self::Magnet),
            "protocol" => Some(Self::Protocol),
            "ftp" => Some(Self::Ftp),
            _ => None,
        }
    }
}

/// 链接来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSource {
    /// 页面抓取
    Scrape,
    /// 目录中同名影片
    Catalog,
    /// AI 匹配服务
    Ai,
    /// 人工补充
    Manual,
}

impl LinkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Catalog => "catalog",
            Self::Ai => "ai",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "catalog" => Self::Catalog,
            "ai" => Self::Ai,
            "manual" => Self::Manual,
            _ => Self::Scrape,
        }
    }

    /// 是否计入修复次数（人工补充不计入）
    pub fn counts_as_repair(&self) -> bool {
        matches!(self, Self::Catalog | Self::Ai)
    }
}

/// 下载链接
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLink {
    /// 原始链接
    pub url: String,
    /// 传输类型
    pub kind: LinkKind,
    /// 来源
    pub source: LinkSource,
    /// 是否已尝试过下载
    pub tried: bool,
}

impl DownloadLink {
    /// 解析链接，类型不受支持时返回 None
    pub fn parse(url: &str, source: LinkSource) -> Option<Self> {
        let url = url.trim();
        let kind = LinkKind::detect(url)?;
        Some(Self {
            url: url.to_string(),
            kind,
            source,
            tried: false,
        })
    }

    /// 去重键
    pub fn normalized(&self) -> String {
        normalize_link(&self.url)
    }
}

/// 链接去重键
///
/// 磁力链接只保留 btih 哈希（tracker/dn 参数不同仍视为同一资源），
/// 其余链接统一小写协议头并去掉首尾空白
pub fn normalize_link(url: &str) -> String {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();

    if lower.starts_with("magnet:?") {
        for param in lower["magnet:?".len()..].split('&') {
            if let Some(hash) = param.strip_prefix("xt=urn:btih:") {
                return format!("magnet:?xt=urn:btih:{}", hash);
            }
        }
        return lower;
    }

    match url.find("://") {
        Some(pos) => format!("{}{}", &lower[..pos], &url[pos..]).trim_end_matches('/').to_string(),
        None => url.to_string(),
    }
}

/// 标题归一化：去掉书名号、空白和标点，统一小写
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// 记录主键：优先使用详情页 URL，缺失时退化为 标题+年份
pub fn record_key(detail_url: Option<&str>, title: &str, year: Option<u16>) -> String {
    match detail_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => format!("url:{}", url.trim_end_matches('/')),
        None => format!(
            "title:{}|{}",
            normalize_title(title),
            year.map(|y| y.to_string()).unwrap_or_default()
        ),
    }
}

// =====================================================
// 记录状态
// =====================================================

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// 已发现
    Discovered,
    /// 等待下载
    PendingDownload,
    /// 下载中
    Downloading,
    /// 已下载，待校验
    Downloaded,
    /// 校验通过
    VerifiedOk,
    /// 校验发现损坏
    VerifiedDamaged,
    /// 已补充新链接，等待重新下载
    RepairPending,
    /// 失败
    Failed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 8] = [
        Self::Discovered,
        Self::PendingDownload,
        Self::Downloading,
        Self::Downloaded,
        Self::VerifiedOk,
        Self::VerifiedDamaged,
        Self::RepairPending,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::PendingDownload => "pending_download",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::VerifiedOk => "verified_ok",
            Self::VerifiedDamaged => "verified_damaged",
            Self::RepairPending => "repair_pending",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// 终态：流水线不再自动处理
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::VerifiedOk | Self::Failed)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =====================================================
// 记录
// =====================================================

/// 抓取得到的记录草稿
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
    pub title: String,
    pub year: Option<u16>,
    pub detail_url: Option<String>,
    pub subtitle: Option<String>,
    pub resolution: Option<String>,
    pub links: Vec<DownloadLink>,
}

impl RecordDraft {
    pub fn key(&self) -> String {
        record_key(self.detail_url.as_deref(), &self.title, self.year)
    }
}

/// 影片记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieRecord {
    pub key: String,
    pub title: String,
    pub normalized_title: String,
    pub year: Option<u16>,
    pub detail_url: Option<String>,
    pub subtitle: Option<String>,
    pub resolution: Option<String>,
    /// 有序链接集合
    pub links: Vec<DownloadLink>,
    pub status: RecordStatus,
    /// 下载失败次数
    pub attempts: u32,
    /// 修复（补链）次数
    pub repair_count: u32,
    pub last_error: Option<String>,
    /// 当前引擎任务句柄
    pub task_gid: Option<String>,
    /// 当前任务使用的链接
    pub task_link: Option<String>,
    /// 下载产物路径
    pub artifact_path: Option<PathBuf>,
    pub artifact_size: Option<u64>,
    /// 探测得到的时长（秒）
    pub duration_secs: Option<f64>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MovieRecord {
    /// 尚未尝试的链接（保持原有顺序）
    pub fn untried_links(&self) -> impl Iterator<Item = &DownloadLink> {
        self.links.iter().filter(|l| !l.tried)
    }

    pub fn tried_count(&self) -> usize {
        self.links.iter().filter(|l| l.tried).count()
    }

    /// 是否已包含该链接（按去重键比较）
    pub fn has_link(&self, url: &str) -> bool {
        let key = normalize_link(url);
        self.links.iter().any(|l| l.normalized() == key)
    }

    /// 显示名称，如 "流浪地球 (2019)"
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

// =====================================================
// 状态更新
// =====================================================

/// 任务句柄变更
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TaskBinding {
    /// 保持不变
    #[default]
    Keep,
    /// 绑定新任务
    Bind { gid: String, link: String },
    /// 清除任务
    Clear,
}

/// 状态更新请求
///
/// `CatalogStore::update_status` 是状态/计数字段的唯一修改入口。
/// `error` 为 None 时保留原有错误信息，进入 `verified_ok` 时清空
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: RecordStatus,
    pub error: Option<String>,
    pub count_attempt: bool,
    pub mark_tried: Option<String>,
    pub task: TaskBinding,
    pub artifact: Option<(PathBuf, u64)>,
    pub duration_secs: Option<f64>,
}

impl StatusUpdate {
    pub fn to(status: RecordStatus) -> Self {
        Self {
            status,
            error: None,
            count_attempt: false,
            mark_tried: None,
            task: TaskBinding::Keep,
            artifact: None,
            duration_secs: None,
        }
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// 失败次数 +1
    pub fn count_attempt(mut self) -> Self {
        self.count_attempt = true;
        self
    }

    pub fn mark_tried(mut self, url: impl Into<String>) -> Self {
        self.mark_tried = Some(url.into());
        self
    }

    pub fn bind_task(mut self, gid: impl Into<String>, link: impl Into<String>) -> Self {
        self.task = TaskBinding::Bind {
            gid: gid.into(),
            link: link.into(),
        };
        self
    }

    pub fn clear_task(mut self) -> Self {
        self.task = TaskBinding::Clear;
        self
    }

    pub fn artifact(mut self, path: PathBuf, size: u64) -> Self {
        self.artifact = Some((path, size));
        self
    }

    pub fn duration(mut self, duration_secs: Option<f64>) -> Self {
        self.duration_secs = duration_secs;
        self
    }
}

/// upsert 结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 新记录
    Inserted { key: String },
    /// 合并了新链接；`revived` 表示记录从 failed 恢复为 pending_download
    Merged {
        key: String,
        new_links: usize,
        revived: bool,
    },
    /// 没有新信息
    Unchanged { key: String },
}

impl UpsertOutcome {
    pub fn key(&self) -> &str {
        match self {
            Self::Inserted { key } | Self::Merged { key, .. } | Self::Unchanged { key } => key,
        }
    }
}
