//! 下载编排
//!
//! 从目录中挑选待下载记录提交给下载引擎，轮询任务直到终态，
//! 并把结果写回目录。每条记录同一时间最多只有一个引擎任务

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::link_policy::LinkPolicy;
use super::task::{DownloadTask, FileArtifact};
use crate::catalog::{normalize_link, MovieRecord, RecordStatus, StatusUpdate};
use crate::engine::{DownloadEngine, EngineTaskStatus};
use crate::error::Result;
use crate::pipeline::PipelineContext;

/// 提交重试的基础等待时间
const SUBMIT_BACKOFF_MS: u64 = 500;

/// 单条记录的提交结果
#[derive(Debug, Clone, PartialEq)]
enum SubmitOutcome {
    Submitted,
    /// 没有可尝试的链接
    Exhausted,
    /// 引擎持续拒绝
    Rejected,
    /// 已被其他调用处理
    Skipped,
}

/// 提交统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmitReport {
    pub submitted: usize,
    pub exhausted: usize,
    pub rejected: usize,
    pub skipped: usize,
}

/// 轮询统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    /// 下载完成的产物
    pub completed: Vec<FileArtifact>,
    /// 本次失败并重新排队的记录
    pub retried: Vec<String>,
    /// 链接耗尽而失败的记录
    pub failed: Vec<String>,
    /// 引擎丢失任务、重新排队的记录
    pub lost: Vec<String>,
    /// 仍在下载中的任务数
    pub in_progress: usize,
}

/// 启动对账统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub requeued: usize,
}

/// 运行统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadRunReport {
    pub cycles: u64,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// 下载编排器
pub struct DownloadOrchestrator {
    ctx: PipelineContext,
    engine: Arc<dyn DownloadEngine>,
    policy: LinkPolicy,
    /// 进行中的任务（record_key -> task）
    outstanding: RwLock<HashMap<String, DownloadTask>>,
    /// 串行化提交批次
    submit_gate: Mutex<()>,
    /// 是否接受新提交
    accepting: AtomicBool,
}

impl DownloadOrchestrator {
    pub fn new(ctx: PipelineContext, engine: Arc<dyn DownloadEngine>) -> Self {
        let policy = LinkPolicy::new(ctx.config.download.link_preference.clone());
        Self {
            ctx,
            engine,
            policy,
            outstanding: RwLock::new(HashMap::new()),
            submit_gate: Mutex::new(()),
            accepting: AtomicBool::new(true),
        }
    }

    /// 进行中的任务数
    pub async fn active_count(&self) -> usize {
        self.outstanding.read().await.len()
    }

    /// 进行中任务的快照
    pub async fn tasks(&self) -> Vec<DownloadTask> {
        self.outstanding.read().await.values().cloned().collect()
    }

    /// discovered -> pending_download
    pub async fn enqueue_discovered(&self, limit: Option<usize>) -> Result<usize> {
        let records = self.ctx.store.list_by_status(RecordStatus::Discovered)?;
        let mut enqueued = 0;

        for record in records.into_iter().take(limit.unwrap_or(usize::MAX)) {
            let _guard = self.ctx.locks.acquire(&record.key).await;
            let current = self.ctx.store.get(&record.key)?;
            if current.map(|r| r.status) != Some(RecordStatus::Discovered) {
                continue;
            }
            self.ctx
                .store
                .update_status(&record.key, StatusUpdate::to(RecordStatus::PendingDownload))?;
            enqueued += 1;
        }

        if enqueued > 0 {
            info!("已加入下载队列: {} 条记录", enqueued);
        }
        Ok(enqueued)
    }

    /// 提交待下载记录（修复记录优先）
    pub async fn submit_pending(&self, max_concurrent: usize) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(report);
        }

        let _gate = self.submit_gate.lock().await;

        let slots = max_concurrent.saturating_sub(self.active_count().await);
        if slots == 0 {
            debug!("下载槽位已满，跳过本轮提交");
            return Ok(report);
        }

        let mut candidates = self.ctx.store.list_by_status(RecordStatus::RepairPending)?;
        candidates.extend(self.ctx.store.list_by_status(RecordStatus::PendingDownload)?);
        candidates.truncate(slots);

        if candidates.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Result<SubmitOutcome>> = stream::iter(candidates)
            .map(|record| self.submit_one(record.key))
            .buffer_unordered(slots)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome? {
                SubmitOutcome::Submitted => report.submitted += 1,
                SubmitOutcome::Exhausted => report.exhausted += 1,
                SubmitOutcome::Rejected => report.rejected += 1,
                SubmitOutcome::Skipped => report.skipped += 1,
            }
        }

        info!(
            "提交完成: 提交 {}, 无可用链接 {}, 引擎拒绝 {}, 跳过 {}",
            report.submitted, report.exhausted, report.rejected, report.skipped
        );
        Ok(report)
    }

    /// 影片下载目录: <download_dir>/<片名>_<年份>
    fn output_dir(&self, record: &MovieRecord) -> PathBuf {
        let year = record
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "未知年份".to_string());
        let name: String = format!("{}_{}", record.title, year)
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c => c,
            })
            .collect();
        self.ctx.config.download.download_dir.join(name)
    }

    async fn submit_one(&self, key: String) -> Result<SubmitOutcome> {
        let _guard = self.ctx.locks.acquire(&key).await;

        if !self.accepting.load(Ordering::SeqCst) || self.outstanding.read().await.contains_key(&key) {
            return Ok(SubmitOutcome::Skipped);
        }

        // 拿到锁后重新读取，状态可能已被其他调用推进
        let Some(record) = self.ctx.store.get(&key)? else {
            return Ok(SubmitOutcome::Skipped);
        };
        if !matches!(
            record.status,
            RecordStatus::PendingDownload | RecordStatus::RepairPending
        ) {
            return Ok(SubmitOutcome::Skipped);
        }

        let Some(link) = self.policy.choose(&record).cloned() else {
            warn!("没有可尝试的下载链接: {}", record.display_name());
            self.ctx.store.update_status(
                &key,
                StatusUpdate::to(RecordStatus::Failed)
                    .error("所有下载链接均已尝试失败")
                    .clear_task(),
            )?;
            return Ok(SubmitOutcome::Exhausted);
        };

        let dir = self.output_dir(&record);
        let retries = self.ctx.config.download.submit_retries;
        let mut attempt = 0;

        let gid = loop {
            match self.engine.add_uri(&link.url, &dir).await {
                Ok(gid) => break gid,
                Err(e) if attempt < retries => {
                    let backoff = Duration::from_millis(SUBMIT_BACKOFF_MS << attempt.min(8));
                    warn!(
                        "提交下载失败，{:?} 后重试 ({}/{}): {}: {}",
                        backoff,
                        attempt + 1,
                        retries,
                        record.display_name(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("提交下载失败: {}: {}", record.display_name(), e);
                    self.ctx.store.update_status(
                        &key,
                        StatusUpdate::to(RecordStatus::Failed)
                            .error(e.to_string())
                            .clear_task(),
                    )?;
                    return Ok(SubmitOutcome::Rejected);
                }
            }
        };

        self.ctx.store.update_status(
            &key,
            StatusUpdate::to(RecordStatus::Downloading).bind_task(gid.clone(), link.url.clone()),
        )?;

        info!(
            "🔥 开始下载: {} [{}] gid={}",
            record.display_name(),
            link.kind.as_str(),
            gid
        );

        self.outstanding
            .write()
            .await
            .insert(key.clone(), DownloadTask::new(key, gid, link.url));

        Ok(SubmitOutcome::Submitted)
    }

    /// 轮询所有进行中的任务
    pub async fn poll_all(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let keys: Vec<String> = self.outstanding.read().await.keys().cloned().collect();

        for key in keys {
            let _guard = self.ctx.locks.acquire(&key).await;

            let Some(mut task) = self.outstanding.read().await.get(&key).cloned() else {
                continue;
            };

            let state = match self.engine.tell_status(&task.gid).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("查询下载状态失败，下轮重试: {} gid={}: {}", key, task.gid, e);
                    report.in_progress += 1;
                    continue;
                }
            };
            task.observe(&state);

            match state.status {
                EngineTaskStatus::Complete if !state.followed_by.is_empty() => {
                    // 磁力元数据下载完成，跟随实际内容任务
                    let next = state.followed_by[0].clone();
                    debug!("磁力元数据完成，跟随任务: {} -> {}", task.gid, next);
                    task.follow(next.clone());
                    self.ctx.store.update_status(
                        &key,
                        StatusUpdate::to(RecordStatus::Downloading).bind_task(next, task.link.clone()),
                    )?;
                    self.outstanding.write().await.insert(key.clone(), task);
                    report.in_progress += 1;
                }
                EngineTaskStatus::Complete => match state.largest_file() {
                    Some(file) => {
                        let artifact = FileArtifact {
                            record_key: key.clone(),
                            path: file.path.clone(),
                            size: file.length,
                        };
                        self.ctx.store.update_status(
                            &key,
                            StatusUpdate::to(RecordStatus::Downloaded)
                                .artifact(artifact.path.clone(), artifact.size)
                                .mark_tried(task.link.clone())
                                .clear_task(),
                        )?;
                        self.outstanding.write().await.remove(&key);
                        info!("✓ 下载完成: {} -> {:?}", key, artifact.path);
                        report.completed.push(artifact);
                    }
                    None => {
                        self.fail_attempt(&key, &task, "下载完成但没有找到文件", &mut report)
                            .await?;
                    }
                },
                EngineTaskStatus::Error | EngineTaskStatus::Removed => {
                    let reason = state
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("下载任务{}", describe(state.status)));
                    self.fail_attempt(&key, &task, &reason, &mut report).await?;
                }
                EngineTaskStatus::Unknown => {
                    warn!("下载引擎丢失任务，重新排队: {} gid={}", key, task.gid);
                    self.ctx.store.update_status(
                        &key,
                        StatusUpdate::to(RecordStatus::PendingDownload)
                            .error(format!("引擎任务丢失: {}", task.gid))
                            .clear_task(),
                    )?;
                    self.outstanding.write().await.remove(&key);
                    report.lost.push(key.clone());
                }
                _ => {
                    debug!(
                        "下载中: {} {:.1}% ({}/{})",
                        key,
                        task.progress(),
                        task.downloaded_size,
                        task.total_size
                    );
                    self.outstanding.write().await.insert(key.clone(), task);
                    report.in_progress += 1;
                }
            }
        }

        Ok(report)
    }

    /// 本次尝试失败：标记链接已尝试、计数，还有未尝试链接则重新排队
    async fn fail_attempt(
        &self,
        key: &str,
        task: &DownloadTask,
        reason: &str,
        report: &mut PollReport,
    ) -> Result<()> {
        self.outstanding.write().await.remove(key);

        let remaining = match self.ctx.store.get(key)? {
            Some(record) => {
                let tried = normalize_link(&task.link);
                record
                    .untried_links()
                    .filter(|l| l.normalized() != tried)
                    .count()
            }
            None => 0,
        };

        let next = if remaining > 0 {
            RecordStatus::PendingDownload
        } else {
            RecordStatus::Failed
        };

        let record = self.ctx.store.update_status(
            key,
            StatusUpdate::to(next)
                .error(reason)
                .count_attempt()
                .mark_tried(task.link.clone())
                .clear_task(),
        )?;

        if next == RecordStatus::Failed {
            error!(
                "下载失败且链接已耗尽: {} (尝试 {} 次): {}",
                record.display_name(),
                record.attempts,
                reason
            );
            report.failed.push(key.to_string());
        } else {
            warn!(
                "下载失败，换下一个链接: {} (剩余 {} 个): {}",
                record.display_name(),
                remaining,
                reason
            );
            report.retried.push(key.to_string());
        }
        Ok(())
    }

    /// 启动时接管上次遗留的 downloading 记录
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in self.ctx.store.list_by_status(RecordStatus::Downloading)? {
            let _guard = self.ctx.locks.acquire(&record.key).await;
            if self.outstanding.read().await.contains_key(&record.key) {
                continue;
            }

            let (Some(gid), Some(link)) = (record.task_gid.clone(), record.task_link.clone()) else {
                self.requeue_lost(&record.key, "记录缺少任务句柄")?;
                report.requeued += 1;
                continue;
            };

            let known = match self.engine.tell_status(&gid).await {
                Ok(state) => state.status != EngineTaskStatus::Unknown,
                Err(e) => {
                    // 引擎暂时不可达时先接管，由轮询决定后续
                    warn!("对账时查询任务失败: {} gid={}: {}", record.key, gid, e);
                    true
                }
            };

            if known {
                self.outstanding
                    .write()
                    .await
                    .insert(record.key.clone(), DownloadTask::new(record.key.clone(), gid, link));
                report.adopted += 1;
            } else {
                self.requeue_lost(&record.key, &format!("引擎任务丢失: {}", gid))?;
                report.requeued += 1;
            }
        }

        if report.adopted + report.requeued > 0 {
            info!(
                "启动对账完成: 接管 {} 个任务, 重新排队 {} 条记录",
                report.adopted, report.requeued
            );
        }
        Ok(report)
    }

    fn requeue_lost(&self, key: &str, reason: &str) -> Result<()> {
        self.ctx.store.update_status(
            key,
            StatusUpdate::to(RecordStatus::PendingDownload)
                .error(reason)
                .clear_task(),
        )?;
        Ok(())
    }

    /// 停止提交新任务；`cancel_in_flight` 时同时取消引擎中的任务
    ///
    /// 记录状态保持 downloading，下次启动时由 `reconcile` 处理
    pub async fn shutdown(&self, cancel_in_flight: bool) -> usize {
        self.accepting.store(false, Ordering::SeqCst);

        if !cancel_in_flight {
            info!("下载编排已停止，保留 {} 个进行中的任务", self.active_count().await);
            return 0;
        }

        let tasks: Vec<DownloadTask> = self.outstanding.write().await.drain().map(|(_, t)| t).collect();
        let mut cancelled = 0;
        for task in tasks {
            match self.engine.remove(&task.gid).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("取消下载任务失败: {} gid={}: {}", task.record_key, task.gid, e),
            }
        }

        info!("下载编排已停止，取消了 {} 个任务", cancelled);
        cancelled
    }

    /// 是否没有待处理的工作
    async fn is_idle(&self) -> Result<bool> {
        if self.active_count().await > 0 {
            return Ok(false);
        }
        let pending = self.ctx.store.list_by_status(RecordStatus::PendingDownload)?;
        let repair = self.ctx.store.list_by_status(RecordStatus::RepairPending)?;
        Ok(pending.is_empty() && repair.is_empty())
    }

    /// 定时提交/轮询，直到取消或没有待处理的工作
    pub async fn run(&self, token: CancellationToken) -> Result<DownloadRunReport> {
        let interval = Duration::from_secs(self.ctx.config.download.poll_interval_secs);
        let max_concurrent = self.ctx.config.download.max_concurrent;
        let mut report = DownloadRunReport::default();

        loop {
            report.cycles += 1;

            let submitted = self.submit_pending(max_concurrent).await?;
            report.submitted += submitted.submitted;
            report.failed += submitted.exhausted + submitted.rejected;

            let polled = self.poll_all().await?;
            report.completed += polled.completed.len();
            report.failed += polled.failed.len();

            if self.is_idle().await? {
                info!("没有待下载的记录，下载循环结束");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => {
                    info!("收到取消信号，下载循环结束");
                    report.cancelled = true;
                    break;
                }
            }
        }

        Ok(report)
    }
}

fn describe(status: EngineTaskStatus) -> &'static str {
    match status {
        EngineTaskStatus::Removed => "已被移除",
        EngineTaskStatus::Error => "出错",
        _ => "异常",
    }
}
