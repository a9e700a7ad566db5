//! 页面抓取模块
//!
//! 按页码区间遍历列表页，逐个抓取详情页并写入影片目录。
//! 每页独立处理，任意页码都可以作为起点重新开始

pub mod fetcher;
pub mod parser;

pub use fetcher::{HttpFetcher, PageFetcher};
pub use parser::{ListingEntry, PageParser};

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, Stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, RecordDraft, RecordStatus, StatusUpdate, UpsertOutcome};
use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};

/// 抓取统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScrapeReport {
    pub pages_scanned: u64,
    pub pages_skipped: u64,
    pub entries_skipped: u64,
    pub inserted: u64,
    pub merged: u64,
    pub unchanged: u64,
    /// 新记录直接进入待下载
    pub enqueued: u64,
}

#[derive(Debug, Default)]
struct ScrapeCounters {
    pages_scanned: AtomicU64,
    pages_skipped: AtomicU64,
    entries_skipped: AtomicU64,
}

impl ScrapeCounters {
    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.pages_scanned.load(Ordering::SeqCst),
            self.pages_skipped.load(Ordering::SeqCst),
            self.entries_skipped.load(Ordering::SeqCst),
        )
    }
}

/// 页面抓取器
pub struct PageScraper {
    config: ScraperConfig,
    fetcher: Arc<dyn PageFetcher>,
    parser: PageParser,
    store: Arc<CatalogStore>,
    counters: ScrapeCounters,
    /// 上次请求时间（用于请求间隔）
    last_request: Mutex<Option<Instant>>,
}

impl PageScraper {
    pub fn new(
        config: ScraperConfig,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<CatalogStore>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            fetcher,
            parser: PageParser::new()?,
            store,
            counters: ScrapeCounters::default(),
            last_request: Mutex::new(None),
        })
    }

    /// 在基础间隔上加入随机抖动
    fn add_jitter(base: Duration, jitter_percent: u32) -> Duration {
        let base_ms = base.as_millis() as f64;
        let range = base_ms * jitter_percent as f64 / 100.0;
        if range <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }

    /// 与上一次请求保持间隔
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let delay = Self::add_jitter(
                Duration::from_millis(self.config.request_delay_ms),
                self.config.jitter_percent,
            );
            let elapsed = previous.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 带指数退避的请求：第 n 次重试前等待 backoff_base * 2^n
    pub async fn fetch_with_retry(&self, url: &str) -> Result<String> {
        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            match self.fetcher.fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_retries => {
                    let backoff = Duration::from_millis(
                        self.config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)),
                    );
                    warn!(
                        "请求失败，{:?} 后重试 ({}/{}): {}",
                        backoff,
                        attempt + 1,
                        self.config.max_retries,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 抓取一页列表，失败时跳过该页
    async fn listing(&self, page: u32) -> Vec<ListingEntry> {
        let url = self.config.list_url(page);
        info!("抓取列表页: {}", url);

        match self.fetch_with_retry(&url).await {
            Ok(html) => {
                self.counters.pages_scanned.fetch_add(1, Ordering::SeqCst);
                let entries = self.parser.parse_listing(&html, &url);
                if entries.is_empty() {
                    warn!("第 {} 页没有找到影片条目", page);
                } else {
                    info!("第 {} 页找到 {} 个影片", page, entries.len());
                }
                entries
            }
            Err(e) => {
                self.counters.pages_skipped.fetch_add(1, Ordering::SeqCst);
                warn!("第 {} 页抓取失败，已跳过: {}", page, e);
                Vec::new()
            }
        }
    }

    /// 抓取并解析一个详情页，失败或信息不完整时返回 None
    async fn detail(&self, entry: ListingEntry) -> Option<RecordDraft> {
        debug!("处理影片: {} ({})", entry.label, entry.url);

        let parsed = match self.fetch_with_retry(&entry.url).await {
            Ok(html) => self.parser.parse_detail(&html, &entry.url),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(draft) => Some(draft),
            Err(e) => {
                self.counters.entries_skipped.fetch_add(1, Ordering::SeqCst);
                warn!("跳过影片条目 {}: {}", entry.url, e);
                None
            }
        }
    }

    /// 按页码区间惰性产生记录草稿
    pub fn drafts(&self, pages: RangeInclusive<u32>) -> impl Stream<Item = RecordDraft> + '_ {
        stream::iter(pages)
            .then(move |page| self.listing(page))
            .flat_map(stream::iter)
            .then(move |entry| self.detail(entry))
            .filter_map(futures::future::ready)
    }

    /// 抓取并立即入库
    ///
    /// `enqueue` 为 true 时新记录直接进入 pending_download
    pub async fn run(&self, pages: RangeInclusive<u32>, enqueue: bool) -> Result<ScrapeReport> {
        let (start, end) = (*pages.start(), *pages.end());
        let before = self.counters.snapshot();
        let mut report = ScrapeReport::default();

        info!("开始抓取: 第 {} 页 - 第 {} 页", start, end);

        let drafts = self.drafts(pages);
        tokio::pin!(drafts);

        while let Some(draft) = drafts.next().await {
            let outcome = match self.store.upsert(&draft) {
                Ok(outcome) => outcome,
                Err(e @ PipelineError::InvalidRecord(_)) => {
                    report.entries_skipped += 1;
                    warn!("无效记录已跳过: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match &outcome {
                UpsertOutcome::Inserted { key } => {
                    report.inserted += 1;
                    info!("新增影片: {} ({:?})", draft.title, draft.year);
                    if enqueue {
                        self.store
                            .update_status(key, StatusUpdate::to(RecordStatus::PendingDownload))?;
                        report.enqueued += 1;
                    }
                }
                UpsertOutcome::Merged {
                    new_links, revived, ..
                } => {
                    report.merged += 1;
                    info!(
                        "影片已存在，合并 {} 个新链接: {}{}",
                        new_links,
                        draft.title,
                        if *revived { "（已恢复为待下载）" } else { "" }
                    );
                }
                UpsertOutcome::Unchanged { .. } => {
                    report.unchanged += 1;
                    debug!("影片已存在: {}", draft.title);
                }
            }
        }

        let after = self.counters.snapshot();
        report.pages_scanned = after.0 - before.0;
        report.pages_skipped = after.1 - before.1;
        report.entries_skipped += after.2 - before.2;

        info!(
            "抓取完成: 扫描 {} 页, 跳过 {} 页, 跳过 {} 条, 新增 {}, 合并 {}, 无变化 {}",
            report.pages_scanned,
            report.pages_skipped,
            report.entries_skipped,
            report.inserted,
            report.merged,
            report.unchanged
        );
        Ok(report)
    }
}
