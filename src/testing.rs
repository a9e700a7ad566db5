//! 测试替身：页面、下载引擎、媒体探测、AI 匹配服务的内存实现

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::catalog::CatalogStore;
use crate::checker::{MediaProbe, ProbeReport};
use crate::config::AppConfig;
use crate::engine::{DownloadEngine, EngineFile, EngineTaskState, EngineTaskStatus};
use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineContext;
use crate::repair::{MatchQuery, MatchService};

/// 临时目录中的流水线上下文
///
/// 提交不重试、轮询间隔 1 秒、AI 调用间隔很短，数据库与下载目录都在临时目录中
pub fn test_context() -> (PipelineContext, TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let mut config = AppConfig::sample();
    config.download.download_dir = dir.path().join("downloads");
    config.download.submit_retries = 0;
    config.download.poll_interval_secs = 1;
    config.checker.probe_retries = 2;
    config.checker.probe_workers = 2;
    config.repair.max_repair_attempts = 2;
    config.repair.max_ai_calls = 2;
    config.repair.min_call_interval_ms = 10;
    config.persistence.db_path = dir.path().join("db").join("movie.db");
    config.log.enabled = false;

    let store = CatalogStore::open(&config.persistence.db_path).unwrap();
    (PipelineContext::new(config, store), dir)
}

// ============================================================================
// 页面
// ============================================================================

/// 固定页面；未登记的地址返回瞬时错误
#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, String>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.set_page(url, html);
        self
    }

    pub fn set_page(&self, url: &str, html: &str) {
        self.pages.lock().insert(url.to_string(), html.to_string());
    }

    /// 地址被请求的次数
    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl crate::scraper::PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        *self.hits.lock().entry(url.to_string()).or_insert(0) += 1;
        self.pages
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::TransientFetch {
                url: url.to_string(),
                reason: "HTTP 404".to_string(),
            })
    }
}

// ============================================================================
// 下载引擎
// ============================================================================

#[derive(Default)]
struct EngineState {
    next_gid: u64,
    tasks: HashMap<String, EngineTaskState>,
    /// gid -> (链接, 下载目录)
    sources: HashMap<String, (String, PathBuf)>,
    submissions: Vec<(String, PathBuf)>,
    removed: Vec<String>,
    reject: bool,
}

/// 按脚本推进的下载引擎
///
/// 提交的任务 gid 依次为 gid-1, gid-2 ...，初始状态为 active；
/// 从未出现过的 gid 报告为 unknown
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<EngineState>,
    submit_delay: Option<Duration>,
    /// 轮询时自动完成，产物写到 <下载目录>/<gid>.mkv，内容为链接本身
    auto_complete: Option<u64>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn auto_complete(mut self, size: u64) -> Self {
        self.auto_complete = Some(size);
        self
    }

    pub fn submissions(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().submissions.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject = reject;
    }

    pub fn set_active(&self, gid: &str) {
        let mut state = EngineTaskState::unknown(gid);
        state.status = EngineTaskStatus::Active;
        self.state.lock().tasks.insert(gid.to_string(), state);
    }

    pub fn fail(&self, gid: &str, message: &str) {
        let mut guard = self.state.lock();
        let task = guard
            .tasks
            .entry(gid.to_string())
            .or_insert_with(|| EngineTaskState::unknown(gid));
        task.status = EngineTaskStatus::Error;
        task.error_message = Some(message.to_string());
    }

    /// 磁力元数据完成，由 next 继续下载
    pub fn follow(&self, gid: &str, next: &str) {
        let mut guard = self.state.lock();
        let task = guard
            .tasks
            .entry(gid.to_string())
            .or_insert_with(|| EngineTaskState::unknown(gid));
        task.status = EngineTaskStatus::Complete;
        task.followed_by = vec![next.to_string()];

        let mut follower = EngineTaskState::unknown(next);
        follower.status = EngineTaskStatus::Active;
        guard.tasks.insert(next.to_string(), follower);
        if let Some(source) = guard.sources.get(gid).cloned() {
            guard.sources.insert(next.to_string(), source);
        }
    }

    pub fn complete(&self, gid: &str, path: &Path, size: u64) {
        let mut guard = self.state.lock();
        let task = guard
            .tasks
            .entry(gid.to_string())
            .or_insert_with(|| EngineTaskState::unknown(gid));
        Self::finish(task, path.to_path_buf(), size);
    }

    /// 引擎重启，任务丢失
    pub fn forget(&self, gid: &str) {
        self.state.lock().tasks.remove(gid);
    }

    fn finish(task: &mut EngineTaskState, path: PathBuf, size: u64) {
        task.status = EngineTaskStatus::Complete;
        task.total_length = size;
        task.completed_length = size;
        task.files = vec![EngineFile { path, length: size }];
    }
}

#[async_trait]
impl DownloadEngine for ScriptedEngine {
    async fn add_uri(&self, uri: &str, dir: &Path) -> Result<String> {
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.state.lock();
        if guard.reject {
            return Err(PipelineError::Engine("模拟引擎拒绝任务".to_string()));
        }

        guard.next_gid += 1;
        let gid = format!("gid-{}", guard.next_gid);
        let mut task = EngineTaskState::unknown(&gid);
        task.status = EngineTaskStatus::Active;
        guard.tasks.insert(gid.clone(), task);
        guard
            .sources
            .insert(gid.clone(), (uri.to_string(), dir.to_path_buf()));
        guard.submissions.push((uri.to_string(), dir.to_path_buf()));
        Ok(gid)
    }

    async fn tell_status(&self, gid: &str) -> Result<EngineTaskState> {
        let mut guard = self.state.lock();
        let source = guard.sources.get(gid).cloned();

        let Some(task) = guard.tasks.get_mut(gid) else {
            return Ok(EngineTaskState::unknown(gid));
        };

        if let (Some(size), Some((uri, dir))) = (self.auto_complete, source) {
            if task.status == EngineTaskStatus::Active && task.followed_by.is_empty() {
                let path = dir.join(format!("{}.mkv", gid));
                std::fs::create_dir_all(&dir)
                    .and_then(|_| std::fs::write(&path, uri.as_bytes()))
                    .map_err(|e| PipelineError::Engine(e.to_string()))?;
                Self::finish(task, path, size);
            }
        }
        Ok(task.clone())
    }

    async fn remove(&self, gid: &str) -> Result<()> {
        let mut guard = self.state.lock();
        guard.removed.push(gid.to_string());
        if let Some(task) = guard.tasks.get_mut(gid) {
            task.status = EngineTaskStatus::Removed;
        }
        Ok(())
    }
}

// ============================================================================
// 媒体探测
// ============================================================================

#[derive(Default)]
struct ProbeRules {
    /// 路径 -> 错误输出
    damaged: HashMap<PathBuf, String>,
    /// 文件内容（链接）-> 时长
    durations_by_link: HashMap<String, f64>,
    /// 剩余的工具故障次数
    broken: usize,
}

/// 默认所有文件可播放，大小取真实文件大小
pub struct StaticProbe {
    duration_secs: Option<f64>,
    rules: Mutex<ProbeRules>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn healthy(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            rules: Mutex::new(ProbeRules::default()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn damage(&self, path: &Path, detail: &str) {
        self.rules
            .lock()
            .damaged
            .insert(path.to_path_buf(), detail.to_string());
    }

    /// 内容为该链接的文件（见 `ScriptedEngine::auto_complete`）报告指定时长
    pub fn duration_for_link(&self, link: &str, duration_secs: f64) {
        self.rules
            .lock()
            .durations_by_link
            .insert(link.to_string(), duration_secs);
    }

    /// 接下来 n 次探测返回工具故障
    pub fn break_tool(&self, times: usize) {
        self.rules.lock().broken = times;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProbe for StaticProbe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let rules = {
            let mut rules = self.rules.lock();
            if rules.broken > 0 {
                rules.broken -= 1;
                return Err(PipelineError::Probe("模拟探测工具故障".to_string()));
            }
            (
                rules.damaged.get(path).cloned(),
                rules.durations_by_link.clone(),
            )
        };
        let (damaged, durations) = rules;

        let size_bytes = std::fs::metadata(path)
            .map_err(|e| PipelineError::Probe(e.to_string()))?
            .len();

        let duration_secs = if durations.is_empty() {
            self.duration_secs
        } else {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            durations
                .get(content.trim())
                .copied()
                .or(self.duration_secs)
        };

        Ok(ProbeReport {
            duration_secs,
            size_bytes,
            playable: damaged.is_none(),
            detail: damaged,
        })
    }
}

// ============================================================================
// AI 匹配服务
// ============================================================================

/// 按顺序返回预设回复，用完后返回 MatchNotFound
pub struct CannedMatchService {
    replies: Mutex<VecDeque<String>>,
    queries: Mutex<Vec<MatchQuery>>,
    /// 模拟服务不可达
    offline: bool,
}

impl CannedMatchService {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            queries: Mutex::new(Vec::new()),
            offline: false,
        }
    }

    /// 每次调用都返回网络错误
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::replying(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn queries(&self) -> Vec<MatchQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl MatchService for CannedMatchService {
    async fn suggest(&self, query: &MatchQuery) -> Result<String> {
        self.queries.lock().push(query.clone());
        if self.offline {
            return Err(PipelineError::TransientFetch {
                url: "http://ai.test/v1/chat/completions".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| PipelineError::MatchNotFound("没有更多预设回复".to_string()))
    }
}
