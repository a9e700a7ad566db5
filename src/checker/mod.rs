//! 完整性检查
//!
//! 对下载产物做媒体探测，按阈值（大小/时长）判定 正常 / 损坏，
//! 结果写回目录。检查过程不修改、不删除任何文件

pub mod probe;

pub use probe::{FfprobeProbe, MediaProbe, ProbeReport};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{MovieRecord, RecordStatus, StatusUpdate};
use crate::config::CheckerConfig;
use crate::downloader::FileArtifact;
use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineContext;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 探测工具失败后的重试间隔
const PROBE_RETRY_DELAY_MS: u64 = 200;

/// 判定阈值，至少设置一项
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub min_size_bytes: Option<u64>,
    pub min_duration_secs: Option<f64>,
}

impl Threshold {
    pub fn new(min_size_bytes: Option<u64>, min_duration_secs: Option<f64>) -> Result<Self> {
        if min_size_bytes.is_none() && min_duration_secs.is_none() {
            return Err(PipelineError::Config(
                "检查阈值至少需要设置最小大小或最小时长之一".to_string(),
            ));
        }
        if let Some(secs) = min_duration_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(PipelineError::Config(format!("无效的最小时长: {} 秒", secs)));
            }
        }
        Ok(Self {
            min_size_bytes,
            min_duration_secs,
        })
    }

    /// 以 GB 为单位构造（命令行 --min-size-gb）
    pub fn from_gb(min_size_gb: Option<f64>, min_duration_secs: Option<f64>) -> Result<Self> {
        let min_size_bytes = match min_size_gb {
            Some(gb) => {
                // 向上取整，阈值不会因截断而放宽
                let bytes = (gb * BYTES_PER_GB).ceil();
                if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
                    return Err(PipelineError::Config(format!("无效的最小大小: {} GB", gb)));
                }
                Some(bytes as u64)
            }
            None => None,
        };
        Self::new(min_size_bytes, min_duration_secs)
    }

    pub fn from_config(config: &CheckerConfig) -> Result<Self> {
        Self::from_gb(config.min_size_gb, config.min_duration_secs)
    }
}

/// 检查结论
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// 可播放且满足阈值
    Ok { duration_secs: Option<f64> },
    /// 不可播放、低于阈值或文件不存在
    Damaged {
        reason: String,
        duration_secs: Option<f64>,
    },
    /// 探测工具本身失败
    VerifyError(String),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok { .. })
    }

    fn damaged(reason: impl Into<String>) -> Self {
        Verdict::Damaged {
            reason: reason.into(),
            duration_secs: None,
        }
    }
}

/// 按阈值判定探测结果
pub fn classify(report: &ProbeReport, threshold: &Threshold) -> Verdict {
    let duration_secs = report.duration_secs;

    if !report.playable {
        return Verdict::Damaged {
            reason: report
                .detail
                .clone()
                .unwrap_or_else(|| "文件无法播放".to_string()),
            duration_secs,
        };
    }

    if let Some(min) = threshold.min_size_bytes {
        if report.size_bytes < min {
            return Verdict::Damaged {
                reason: format!(
                    "文件大小 {:.2} GB 低于阈值 {:.2} GB",
                    report.size_bytes as f64 / BYTES_PER_GB,
                    min as f64 / BYTES_PER_GB
                ),
                duration_secs,
            };
        }
    }

    if let Some(min) = threshold.min_duration_secs {
        match duration_secs {
            Some(d) if d < min => {
                return Verdict::Damaged {
                    reason: format!("时长 {:.0} 秒低于阈值 {:.0} 秒", d, min),
                    duration_secs,
                };
            }
            None => {
                return Verdict::Damaged {
                    reason: "无法读取时长".to_string(),
                    duration_secs,
                };
            }
            _ => {}
        }
    }

    Verdict::Ok { duration_secs }
}

/// 批量检查统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub checked: usize,
    pub ok: usize,
    /// 判定为损坏的记录
    pub damaged: Vec<String>,
    /// 检查期间状态已被改变而跳过的记录
    pub skipped: usize,
}

/// 完整性检查器
pub struct IntegrityChecker {
    ctx: PipelineContext,
    probe: Arc<dyn MediaProbe>,
}

impl IntegrityChecker {
    pub fn new(ctx: PipelineContext, probe: Arc<dyn MediaProbe>) -> Self {
        Self { ctx, probe }
    }

    /// 检查单个下载产物
    pub async fn verify(&self, artifact: &FileArtifact, threshold: &Threshold) -> Verdict {
        self.verify_path(&artifact.path, threshold).await
    }

    /// 检查单个文件，探测工具失败时重试，仍失败则按损坏处理
    pub async fn verify_path(&self, path: &Path, threshold: &Threshold) -> Verdict {
        let retries = self.ctx.config.checker.probe_retries;
        let mut attempt = 0;

        loop {
            match self.verify_once(path, threshold).await {
                Verdict::VerifyError(msg) if attempt < retries => {
                    attempt += 1;
                    warn!("探测失败，第 {} 次重试: {:?}: {}", attempt, path, msg);
                    tokio::time::sleep(Duration::from_millis(PROBE_RETRY_DELAY_MS)).await;
                }
                Verdict::VerifyError(msg) => {
                    warn!("探测多次失败，按损坏处理: {:?}: {}", path, msg);
                    return Verdict::damaged(format!("探测失败: {}", msg));
                }
                verdict => return verdict,
            }
        }
    }

    async fn verify_once(&self, path: &Path, threshold: &Threshold) -> Verdict {
        if tokio::fs::metadata(path).await.is_err() {
            return Verdict::damaged(format!("文件不存在: {}", path.display()));
        }

        match self.probe.probe(path).await {
            Ok(report) => classify(&report, threshold),
            Err(e) => Verdict::VerifyError(e.to_string()),
        }
    }

    /// 检查一条记录并写回结果，返回 None 表示记录已不在 downloaded 状态
    async fn verify_record(
        &self,
        record: MovieRecord,
        threshold: &Threshold,
    ) -> Result<Option<Verdict>> {
        let verdict = match &record.artifact_path {
            Some(path) => self.verify_path(path, threshold).await,
            None => Verdict::damaged("没有下载产物"),
        };

        let _guard = self.ctx.locks.acquire(&record.key).await;
        let current = self.ctx.store.get(&record.key)?;
        if current.map(|r| r.status) != Some(RecordStatus::Downloaded) {
            debug!("检查期间记录状态已变化，跳过: {}", record.key);
            return Ok(None);
        }

        self.record_verdict(&record, &verdict)?;
        Ok(Some(verdict))
    }

    fn record_verdict(&self, record: &MovieRecord, verdict: &Verdict) -> Result<()> {
        match verdict {
            Verdict::Ok { duration_secs } => {
                self.ctx.store.update_status(
                    &record.key,
                    StatusUpdate::to(RecordStatus::VerifiedOk).duration(*duration_secs),
                )?;
                info!("✓ 校验通过: {}", record.display_name());
            }
            Verdict::Damaged {
                reason,
                duration_secs,
            } => {
                self.ctx.store.update_status(
                    &record.key,
                    StatusUpdate::to(RecordStatus::VerifiedDamaged)
                        .duration(*duration_secs)
                        .error(reason.clone()),
                )?;
                warn!("✗ 文件损坏: {}: {}", record.display_name(), reason);
            }
            Verdict::VerifyError(msg) => {
                // verify_path 不会返回该分支
                warn!("探测失败，保持原状态: {}: {}", record.display_name(), msg);
            }
        }
        Ok(())
    }

    /// 检查所有 downloaded 记录
    pub async fn verify_downloaded(&self, threshold: &Threshold) -> Result<CheckReport> {
        let records = self.ctx.store.list_by_status(RecordStatus::Downloaded)?;
        let workers = self.ctx.config.checker.probe_workers.max(1);
        let mut report = CheckReport::default();

        if records.is_empty() {
            return Ok(report);
        }
        info!("开始校验 {} 个下载文件 (并发 {})", records.len(), workers);

        let results: Vec<(String, Result<Option<Verdict>>)> = stream::iter(records)
            .map(|record| async move {
                let key = record.key.clone();
                (key, self.verify_record(record, threshold).await)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for (key, result) in results {
            match result? {
                Some(verdict) => {
                    report.checked += 1;
                    if verdict.is_ok() {
                        report.ok += 1;
                    } else {
                        report.damaged.push(key);
                    }
                }
                None => report.skipped += 1,
            }
        }

        info!(
            "校验完成: 检查 {} 个, 正常 {} 个, 损坏 {} 个",
            report.checked,
            report.ok,
            report.damaged.len()
        );
        Ok(report)
    }

    /// 递归扫描目录中的视频文件，目录中有对应记录的同步写回
    pub async fn scan_directory(
        &self,
        dir: &Path,
        threshold: &Threshold,
    ) -> Result<Vec<(PathBuf, Verdict)>> {
        if !dir.is_dir() {
            return Err(PipelineError::NotFound(format!("目录不存在: {}", dir.display())));
        }

        let files = collect_videos(dir, &self.ctx.config.checker.video_extensions).await?;
        info!("🔥 扫描到 {} 个视频文件: {:?}", files.len(), dir);

        let workers = self.ctx.config.checker.probe_workers.max(1);
        let mut results: Vec<(PathBuf, Verdict)> = stream::iter(files)
            .map(|path| async move {
                let verdict = self.verify_path(&path, threshold).await;
                (path, verdict)
            })
            .buffer_unordered(workers)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, verdict) in &results {
            let Some(record) = self.ctx.store.find_by_artifact_path(path)? else {
                continue;
            };
            let _guard = self.ctx.locks.acquire(&record.key).await;
            let Some(current) = self.ctx.store.get(&record.key)? else {
                continue;
            };
            if matches!(
                current.status,
                RecordStatus::Downloaded | RecordStatus::VerifiedOk
            ) {
                self.record_verdict(&current, verdict)?;
            }
        }

        Ok(results)
    }
}

/// 在阻塞线程中遍历目录，按扩展名筛选视频文件
async fn collect_videos(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let dir = dir.to_path_buf();
    let extensions: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();

    tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| extensions.iter().any(|x| x.trim_start_matches('.') == e.to_lowercase()))
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect()
    })
    .await
    .map_err(|e| PipelineError::Probe(format!("目录扫描任务异常: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DownloadLink, LinkSource, RecordDraft};
    use crate::testing::{test_context, StaticProbe};

    fn report(size: u64, duration: Option<f64>, playable: bool) -> ProbeReport {
        ProbeReport {
            duration_secs: duration,
            size_bytes: size,
            playable,
            detail: None,
        }
    }

    /// 造一条 downloaded 记录，产物写到临时目录
    fn seed_downloaded(ctx: &PipelineContext, dir: &Path, title: &str, bytes: usize) -> (String, PathBuf) {
        let draft = RecordDraft {
            title: title.to_string(),
            year: Some(2020),
            detail_url: Some(format!("https://site.test/{}.html", title)),
            subtitle: None,
            resolution: None,
            links: vec![DownloadLink::parse("magnet:?xt=urn:btih:AAA", LinkSource::Scrape).unwrap()],
        };
        let key = ctx.store.upsert(&draft).unwrap().key().to_string();
        let path = dir.join(format!("{}.mkv", title));
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        ctx.store
            .update_status(
                &key,
                StatusUpdate::to(RecordStatus::Downloaded).artifact(path.clone(), bytes as u64),
            )
            .unwrap();
        (key, path)
    }

    #[test]
    fn test_threshold_requires_a_bound() {
        assert!(Threshold::new(None, None).is_err());
        assert!(Threshold::from_gb(Some(-1.0), None).is_err());

        let t = Threshold::from_gb(Some(1.5), None).unwrap();
        assert_eq!(t.min_size_bytes, Some(1_610_612_736));
    }

    #[test]
    fn test_threshold_rejects_invalid_values() {
        assert!(Threshold::from_gb(Some(f64::NAN), None).is_err());
        assert!(Threshold::from_gb(Some(f64::INFINITY), None).is_err());
        assert!(Threshold::from_gb(Some(1e12), None).is_err());
        assert!(Threshold::new(None, Some(f64::NAN)).is_err());
        assert!(Threshold::new(None, Some(-60.0)).is_err());
        assert!(Threshold::from_gb(Some(1.0), Some(f64::INFINITY)).is_err());

        // 小数字节向上取整
        let t = Threshold::from_gb(Some(1e-10), None).unwrap();
        assert_eq!(t.min_size_bytes, Some(1));
        assert_eq!(Threshold::from_gb(Some(0.0), None).unwrap().min_size_bytes, Some(0));
    }

    #[test]
    fn test_classify_by_size() {
        let t = Threshold::new(Some(1000), None).unwrap();
        assert!(classify(&report(1000, None, true), &t).is_ok());
        assert!(!classify(&report(999, None, true), &t).is_ok());
    }

    #[test]
    fn test_classify_by_duration() {
        let t = Threshold::new(None, Some(3600.0)).unwrap();
        assert!(classify(&report(1, Some(5400.0), true), &t).is_ok());
        assert!(!classify(&report(1, Some(1200.0), true), &t).is_ok());
        // 需要时长却读不到
        assert!(!classify(&report(1, None, true), &t).is_ok());
    }

    #[test]
    fn test_classify_unplayable_wins() {
        let t = Threshold::new(Some(1), None).unwrap();
        let mut r = report(10_000, Some(7200.0), false);
        r.detail = Some("moov atom not found".to_string());
        assert_eq!(
            classify(&r, &t),
            Verdict::Damaged {
                reason: "moov atom not found".to_string(),
                duration_secs: Some(7200.0),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_damaged() {
        let (ctx, dir) = test_context();
        let checker = IntegrityChecker::new(ctx, Arc::new(StaticProbe::healthy(Some(7200.0))));
        let t = Threshold::new(Some(1), None).unwrap();

        let verdict = checker.verify_path(&dir.path().join("gone.mkv"), &t).await;
        assert!(matches!(verdict, Verdict::Damaged { .. }));
    }

    #[tokio::test]
    async fn test_probe_errors_retry_then_downgrade() {
        let (ctx, dir) = test_context();
        let retries = ctx.config.checker.probe_retries as usize;
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let t = Threshold::new(Some(1), None).unwrap();

        // 失败次数在重试范围内，最终通过
        let probe = Arc::new(StaticProbe::healthy(Some(7200.0)));
        probe.break_tool(retries);
        let checker = IntegrityChecker::new(ctx.clone(), probe.clone());
        assert!(checker.verify_path(&path, &t).await.is_ok());
        assert_eq!(probe.calls(), retries + 1);

        // 一直失败，降级为损坏
        let probe = Arc::new(StaticProbe::healthy(Some(7200.0)));
        probe.break_tool(usize::MAX);
        let checker = IntegrityChecker::new(ctx, probe.clone());
        let verdict = checker.verify_path(&path, &t).await;
        assert!(matches!(verdict, Verdict::Damaged { .. }));
        assert_eq!(probe.calls(), retries + 1);
    }

    #[tokio::test]
    async fn test_verify_downloaded_writes_status() {
        let (ctx, dir) = test_context();
        let (good, _) = seed_downloaded(&ctx, dir.path(), "好", 4096);
        let (small, _) = seed_downloaded(&ctx, dir.path(), "小", 16);
        let (broken, broken_path) = seed_downloaded(&ctx, dir.path(), "坏", 4096);

        let probe = Arc::new(StaticProbe::healthy(Some(6000.0)));
        probe.damage(&broken_path, "Invalid data found when processing input");
        let checker = IntegrityChecker::new(ctx.clone(), probe);

        let t = Threshold::new(Some(1024), None).unwrap();
        let report = checker.verify_downloaded(&t).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.ok, 1);
        assert_eq!(report.damaged.len(), 2);

        let good = ctx.store.get(&good).unwrap().unwrap();
        assert_eq!(good.status, RecordStatus::VerifiedOk);
        assert_eq!(good.duration_secs, Some(6000.0));
        assert!(good.last_error.is_none());

        let small = ctx.store.get(&small).unwrap().unwrap();
        assert_eq!(small.status, RecordStatus::VerifiedDamaged);
        assert!(small.last_error.unwrap().contains("低于阈值"));

        let broken = ctx.store.get(&broken).unwrap().unwrap();
        assert_eq!(broken.status, RecordStatus::VerifiedDamaged);
        assert!(broken.last_error.unwrap().contains("Invalid data"));

        // 第二次运行没有 downloaded 记录
        assert_eq!(checker.verify_downloaded(&t).await.unwrap().checked, 0);
    }

    #[tokio::test]
    async fn test_scan_directory_filters_and_marks_records() {
        let (ctx, dir) = test_context();
        let movies = dir.path().join("movies");
        std::fs::create_dir_all(movies.join("sub")).unwrap();

        let (key, tracked) = seed_downloaded(&ctx, &movies, "甲", 4096);
        ctx.store
            .update_status(&key, StatusUpdate::to(RecordStatus::VerifiedOk))
            .unwrap();
        std::fs::write(movies.join("sub").join("b.MP4"), vec![0u8; 4096]).unwrap();
        std::fs::write(movies.join("notes.txt"), b"hello").unwrap();

        let probe = Arc::new(StaticProbe::healthy(Some(6000.0)));
        probe.damage(&tracked, "truncated");
        let checker = IntegrityChecker::new(ctx.clone(), probe);

        let t = Threshold::new(Some(1024), None).unwrap();
        let results = checker.scan_directory(&movies, &t).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(p, _)| p.extension().unwrap() != "txt"));

        let record = ctx.store.get(&key).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::VerifiedDamaged);
        assert!(tracked.exists());
    }

    #[tokio::test]
    async fn test_scan_missing_directory() {
        let (ctx, dir) = test_context();
        let checker = IntegrityChecker::new(ctx, Arc::new(StaticProbe::healthy(None)));
        let t = Threshold::new(Some(1), None).unwrap();
        assert!(matches!(
            checker.scan_directory(&dir.path().join("nope"), &t).await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
