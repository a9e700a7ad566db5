//! 流水线编排
//!
//! 抓取 → 入库 → 下载 → 校验 → 修复，各阶段只通过目录读写记录，
//! 修复后的记录由下一轮下载阶段接手

use std::ops::RangeInclusive;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::CatalogStore;
use crate::checker::{CheckReport, FfprobeProbe, IntegrityChecker, MediaProbe, Threshold};
use crate::config::AppConfig;
use crate::downloader::{DownloadOrchestrator, DownloadRunReport};
use crate::engine::{Aria2Client, DownloadEngine};
use crate::error::Result;
use crate::repair::{MatchService, OpenAiMatchService, RepairMatcher, RepairReport};
use crate::scraper::{HttpFetcher, PageFetcher, PageScraper, ScrapeReport};

/// 记录级互斥锁（不同记录之间互不阻塞）
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// 各阶段共享的上下文
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<CatalogStore>,
    pub locks: Arc<RecordLocks>,
}

impl PipelineContext {
    pub fn new(config: AppConfig, store: CatalogStore) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            locks: Arc::new(RecordLocks::new()),
        }
    }
}

/// 一轮流水线的统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub scrape: Option<ScrapeReport>,
    pub enqueued: usize,
    pub download: DownloadRunReport,
    pub check: CheckReport,
    pub repair: RepairReport,
}

pub struct Pipeline {
    ctx: PipelineContext,
    scraper: PageScraper,
    orchestrator: DownloadOrchestrator,
    checker: IntegrityChecker,
    matcher: RepairMatcher,
}

impl Pipeline {
    pub fn new(
        ctx: PipelineContext,
        fetcher: Arc<dyn PageFetcher>,
        engine: Arc<dyn DownloadEngine>,
        probe: Arc<dyn MediaProbe>,
        service: Option<Arc<dyn MatchService>>,
    ) -> Result<Self> {
        Ok(Self {
            scraper: PageScraper::new(ctx.config.scraper.clone(), fetcher, ctx.store.clone())?,
            orchestrator: DownloadOrchestrator::new(ctx.clone(), engine),
            checker: IntegrityChecker::new(ctx.clone(), probe),
            matcher: RepairMatcher::new(ctx.clone(), service),
            ctx,
        })
    }

    /// 使用 HTTP 抓取、aria2、ffprobe、OpenAI 兼容接口构建
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = CatalogStore::open(&config.persistence.db_path)?;
        let fetcher = Arc::new(HttpFetcher::new(&config.scraper)?);
        let engine = Arc::new(Aria2Client::new(&config.download)?);
        let probe = Arc::new(FfprobeProbe::new(&config.checker));
        let service: Option<Arc<dyn MatchService>> = if config.repair.ai.enabled {
            Some(Arc::new(OpenAiMatchService::new(&config.repair.ai)?))
        } else {
            None
        };

        let ctx = PipelineContext::new(config, store);
        Self::new(ctx, fetcher, engine, probe, service)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn scraper(&self) -> &PageScraper {
        &self.scraper
    }

    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    pub fn checker(&self) -> &IntegrityChecker {
        &self.checker
    }

    pub fn matcher(&self) -> &RepairMatcher {
        &self.matcher
    }

    /// 执行一轮：可选抓取 → 下载直到空闲 → 校验 → 修复
    pub async fn run_cycle(
        &self,
        pages: Option<RangeInclusive<u32>>,
        threshold: &Threshold,
        token: CancellationToken,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if let Some(pages) = pages {
            report.scrape = Some(self.scraper.run(pages, true).await?);
        }
        if token.is_cancelled() {
            return Ok(report);
        }

        report.enqueued = self.orchestrator.enqueue_discovered(None).await?;
        report.download = self.orchestrator.run(token).await?;
        if report.download.cancelled {
            return Ok(report);
        }

        report.check = self.checker.verify_downloaded(threshold).await?;
        report.repair = self.matcher.repair_damaged().await?;
        Ok(report)
    }

    /// 连续执行，直到没有修复后重新排队的记录、被取消或达到轮数上限
    ///
    /// 只有第一轮抓取页面；启动时先接管上次遗留的下载任务
    pub async fn run(
        &self,
        pages: Option<RangeInclusive<u32>>,
        threshold: &Threshold,
        max_cycles: u32,
        token: CancellationToken,
    ) -> Result<Vec<CycleReport>> {
        self.orchestrator.reconcile().await?;

        let mut reports = Vec::new();
        let mut pages = pages;

        for cycle in 1..=max_cycles.max(1) {
            if token.is_cancelled() {
                break;
            }
            info!("🔥 第 {} 轮流水线开始", cycle);

            let report = self.run_cycle(pages.take(), threshold, token.clone()).await?;
            let more = !report.repair.requeued.is_empty();
            let cancelled = report.download.cancelled;
            reports.push(report);

            if cancelled || !more {
                break;
            }
        }

        if token.is_cancelled() {
            self.orchestrator.shutdown(false).await;
        }

        let summary = self.ctx.store.count_by_status()?;
        info!("流水线结束: {:?}", summary);
        Ok(reports)
    }
}
