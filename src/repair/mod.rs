//! 损坏记录修复
//!
//! verified_damaged 记录还有未尝试的链接时直接重新排队；
//! 链接用完后寻找一个新的下载链接：先在目录中找同名记录，找不到再询问 AI 匹配服务。
//! 找到后通过 `CatalogStore::requeue_with_link` 重新进入下载阶段并删除损坏文件，找不到则标记失败

pub mod match_service;
pub mod throttle;

pub use match_service::{
    parse_suggestion, MatchCandidate, MatchQuery, MatchService, OpenAiMatchService, Suggestion,
};
pub use throttle::CallThrottle;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{normalize_title, DownloadLink, LinkSource, MovieRecord, RecordStatus, StatusUpdate};
use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineContext;

/// 候选条目的最低相似度
const CANDIDATE_MIN_SIMILARITY: f64 = 0.3;
/// 传给 AI 的候选条目数
const MAX_CANDIDATES: usize = 3;

/// 单条记录的修复结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// 记录还有未尝试的链接，直接重新排队
    Retry { untried: usize },
    /// 已补充新链接并重新排队
    Requeued { link: String, source: LinkSource },
    /// 修复失败，记录已标记为 failed
    Failed { reason: String },
    /// AI 服务暂时不可用，记录保持损坏状态等待下一轮
    Deferred { reason: String },
    /// 记录不在 verified_damaged 状态
    Skipped,
}

/// 修复统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    pub deferred: Vec<String>,
    pub skipped: usize,
}

/// 修复匹配器
pub struct RepairMatcher {
    ctx: PipelineContext,
    /// AI 匹配服务，未启用时为 None
    service: Option<Arc<dyn MatchService>>,
    throttle: CallThrottle,
}

impl RepairMatcher {
    pub fn new(ctx: PipelineContext, service: Option<Arc<dyn MatchService>>) -> Self {
        let interval = Duration::from_millis(ctx.config.repair.min_call_interval_ms);
        Self {
            ctx,
            service,
            throttle: CallThrottle::new(interval),
        }
    }

    /// 处理所有 verified_damaged 记录（逐条串行）
    pub async fn repair_damaged(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let records = self.ctx.store.list_by_status(RecordStatus::VerifiedDamaged)?;
        if records.is_empty() {
            return Ok(report);
        }
        info!("开始修复 {} 条损坏记录", records.len());

        for record in records {
            match self.find_replacement(&record).await? {
                RepairOutcome::Retry { .. } | RepairOutcome::Requeued { .. } => {
                    report.requeued.push(record.key)
                }
                RepairOutcome::Failed { .. } => report.failed.push(record.key),
                RepairOutcome::Deferred { .. } => report.deferred.push(record.key),
                RepairOutcome::Skipped => report.skipped += 1,
            }
        }

        info!(
            "修复完成: 重新排队 {} 条, 失败 {} 条, 推迟 {} 条",
            report.requeued.len(),
            report.failed.len(),
            report.deferred.len()
        );
        Ok(report)
    }

    /// 为一条损坏记录寻找替代链接
    pub async fn find_replacement(&self, record: &MovieRecord) -> Result<RepairOutcome> {
        let _guard = self.ctx.locks.acquire(&record.key).await;

        let Some(current) = self.ctx.store.get(&record.key)? else {
            return Err(PipelineError::NotFound(record.key.clone()));
        };
        if current.status != RecordStatus::VerifiedDamaged {
            debug!("记录不在损坏状态，跳过修复: {} ({})", current.key, current.status);
            return Ok(RepairOutcome::Skipped);
        }

        // 自身链接还没用完时不需要寻找新链接
        let untried = current.untried_links().count();
        if untried > 0 {
            self.ctx.store.requeue(&current.key)?;
            self.discard_artifact(current.artifact_path.as_deref()).await;
            info!(
                "损坏记录还有 {} 个未尝试的链接，重新排队: {}",
                untried,
                current.display_name()
            );
            return Ok(RepairOutcome::Retry { untried });
        }

        let max = self.ctx.config.repair.max_repair_attempts;
        if current.repair_count >= max {
            let reason = format!("修复次数已达上限 ({}/{})", current.repair_count, max);
            return self.give_up(&current, reason);
        }

        let found = match self.catalog_match(&current)? {
            Some(link) => Ok(link),
            None => self.ask_service(&current).await,
        };

        match found {
            Ok(link) => match self.ctx.store.requeue_with_link(&current.key, &link) {
                Ok(_) => {
                    self.discard_artifact(current.artifact_path.as_deref()).await;
                    info!(
                        "🔥 找到替代链接: {} <- {} (来源={})",
                        current.display_name(),
                        link.url,
                        link.source.as_str()
                    );
                    Ok(RepairOutcome::Requeued {
                        link: link.url,
                        source: link.source,
                    })
                }
                Err(e @ PipelineError::InvalidRecord(_)) => self.give_up(&current, e.to_string()),
                Err(e) => Err(e),
            },
            Err(e) if e.is_transient() => {
                warn!("AI 服务暂不可用，下一轮再修复: {}: {}", current.display_name(), e);
                Ok(RepairOutcome::Deferred {
                    reason: e.to_string(),
                })
            }
            Err(e) => self.give_up(&current, e.to_string()),
        }
    }

    /// 删除已被替换的损坏文件，失败只记录警告
    async fn discard_artifact(&self, path: Option<&Path>) {
        let Some(path) = path else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("已删除损坏文件: {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("损坏文件已不存在: {:?}", path)
            }
            Err(e) => warn!("删除损坏文件失败: {:?}: {}", path, e),
        }
    }

    fn give_up(&self, record: &MovieRecord, reason: String) -> Result<RepairOutcome> {
        self.ctx
            .store
            .update_status(&record.key, StatusUpdate::to(RecordStatus::Failed).error(reason.clone()))?;
        warn!("修复失败: {}: {}", record.display_name(), reason);
        Ok(RepairOutcome::Failed { reason })
    }

    /// 目录中同名（年份一致）记录上、本记录还没有尝试过的链接
    ///
    /// 同名记录自身下载成功的链接同样可用
    fn catalog_match(&self, record: &MovieRecord) -> Result<Option<DownloadLink>> {
        let donors = self.ctx.store.find_by_normalized_title(&record.normalized_title)?;

        let link = donors
            .iter()
            .filter(|d| d.key != record.key)
            .filter(|d| match (d.year, record.year) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .flat_map(|d| d.links.iter())
            .find(|l| !record.has_link(&l.url))
            .map(|l| DownloadLink {
                url: l.url.clone(),
                kind: l.kind,
                source: LinkSource::Catalog,
                tried: false,
            });

        if let Some(link) = &link {
            debug!("目录中找到同名记录的链接: {} -> {}", record.key, link.url);
        }
        Ok(link)
    }

    /// 名称相近、年份相容的其他记录，作为 AI 的参考
    fn candidates(&self, record: &MovieRecord) -> Result<Vec<MatchCandidate>> {
        let mut scored: Vec<(f64, MatchCandidate)> = self
            .ctx
            .store
            .list_all()?
            .into_iter()
            .filter(|r| r.key != record.key)
            .filter(|r| match (r.year, record.year) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .filter_map(|r| {
                let score = title_similarity(&r.normalized_title, &record.normalized_title);
                if score <= CANDIDATE_MIN_SIMILARITY {
                    return None;
                }
                let link = r.links.iter().find(|l| !record.has_link(&l.url))?;
                Some((
                    score,
                    MatchCandidate {
                        title: r.title.clone(),
                        year: r.year,
                        link: link.url.clone(),
                    },
                ))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(MAX_CANDIDATES).map(|(_, c)| c).collect())
    }

    /// 询问 AI，最多 max_ai_calls 次，返回最后一次的错误
    ///
    /// 只要有一次得到了服务的回复，就不再返回瞬时错误
    async fn ask_service(&self, record: &MovieRecord) -> Result<DownloadLink> {
        let Some(service) = &self.service else {
            return Err(PipelineError::MatchNotFound(
                "目录中没有可用的替代链接，且未启用 AI 匹配".to_string(),
            ));
        };

        let query = MatchQuery {
            title: record.title.clone(),
            year: record.year,
            known_links: record.links.iter().map(|l| l.url.clone()).collect(),
            candidates: self.candidates(record)?,
        };

        let max_calls = self.ctx.config.repair.max_ai_calls.max(1);
        let mut last_error: Option<PipelineError> = None;

        for call in 1..=max_calls {
            self.throttle.acquire().await;
            debug!("询问 AI ({}/{}): {}", call, max_calls, record.display_name());

            let result = service
                .suggest(&query)
                .await
                .and_then(|raw| parse_suggestion(&raw))
                .and_then(|s| validate_suggestion(record, &s));

            match result {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!("AI 匹配未成功 ({}/{}): {}: {}", call, max_calls, record.display_name(), e);
                    let answered = last_error.as_ref().is_some_and(|l| !l.is_transient());
                    if !(answered && e.is_transient()) {
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::MatchNotFound(format!("AI 未找到替代链接: {}", record.display_name()))
        }))
    }
}

/// 校验 AI 建议：支持的链接类型，且不在记录中
fn validate_suggestion(record: &MovieRecord, suggestion: &Suggestion) -> Result<DownloadLink> {
    let link = DownloadLink::parse(&suggestion.link, LinkSource::Ai).ok_or_else(|| {
        PipelineError::InvalidAiResponse(format!("不支持的链接类型: {}", suggestion.link))
    })?;

    if record.has_link(&link.url) {
        return Err(PipelineError::MatchNotFound(format!(
            "AI 返回的链接已尝试过: {}",
            link.url
        )));
    }
    Ok(link)
}

/// 字符二元组的 Dice 系数，输入为归一化标题
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let left = bigrams(&a);
    let mut right = bigrams(&b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let total = left.len() + right.len();
    let mut shared = 0;
    for pair in &left {
        if let Some(pos) = right.iter().position(|p| p == pair) {
            right.swap_remove(pos);
            shared += 1;
        }
    }
    (2 * shared) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RecordDraft;
    use crate::testing::{test_context, CannedMatchService};

    fn seed(ctx: &PipelineContext, page: &str, title: &str, year: Option<u16>, links: &[&str]) -> String {
        let draft = RecordDraft {
            title: title.to_string(),
            year,
            detail_url: Some(format!("https://site.test/{}.html", page)),
            subtitle: None,
            resolution: None,
            links: links
                .iter()
                .map(|l| DownloadLink::parse(l, LinkSource::Scrape).unwrap())
                .collect(),
        };
        ctx.store.upsert(&draft).unwrap().key().to_string()
    }

    /// 所有链接都已下载过，最后一次的产物损坏
    fn damage(ctx: &PipelineContext, key: &str) -> MovieRecord {
        let record = ctx.store.get(key).unwrap().unwrap();
        for link in &record.links {
            ctx.store
                .update_status(key, StatusUpdate::to(RecordStatus::VerifiedDamaged).mark_tried(link.url.clone()))
                .unwrap();
        }
        ctx.store
            .update_status(
                key,
                StatusUpdate::to(RecordStatus::VerifiedDamaged).error("时长低于阈值"),
            )
            .unwrap()
    }

    /// 在临时目录中写一个损坏文件并登记为记录的产物
    fn damage_with_file(ctx: &PipelineContext, key: &str, dir: &Path) -> (MovieRecord, std::path::PathBuf) {
        damage(ctx, key);
        let path = dir.join("broken.mkv");
        std::fs::write(&path, b"broken").unwrap();
        let record = ctx
            .store
            .update_status(
                key,
                StatusUpdate::to(RecordStatus::VerifiedDamaged).artifact(path.clone(), 6),
            )
            .unwrap();
        (record, path)
    }

    #[test]
    fn test_title_similarity() {
        assert_eq!(title_similarity("流浪地球", "流浪地球"), 1.0);
        assert!(title_similarity("蜘蛛侠：平行宇宙", "蜘蛛侠：穿越平行宇宙") > 0.5);
        assert!(title_similarity("流浪地球", "霸王别姬") < CANDIDATE_MIN_SIMILARITY);
        assert_eq!(title_similarity("", "a"), 0.0);
    }

    #[tokio::test]
    async fn test_catalog_match_preferred_over_ai() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "流浪地球", Some(2019), &["magnet:?xt=urn:btih:AAA"]);
        seed(&ctx, "b", "流浪地球", Some(2019), &["ftp://mirror/wandering.mkv"]);
        let record = damage(&ctx, &a);

        let service = Arc::new(CannedMatchService::replying(&[]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Requeued {
                link: "ftp://mirror/wandering.mkv".to_string(),
                source: LinkSource::Catalog,
            }
        );
        assert_eq!(service.calls(), 0);

        let record = ctx.store.get(&a).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::RepairPending);
        assert_eq!(record.links.len(), 2);
        assert_eq!(record.repair_count, 1);
    }

    #[tokio::test]
    async fn test_year_mismatch_falls_back_to_ai() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "流浪地球", Some(2019), &["magnet:?xt=urn:btih:AAA"]);
        seed(&ctx, "b", "流浪地球", Some(2023), &["ftp://mirror/sequel.mkv"]);
        let record = damage(&ctx, &a);

        let service = Arc::new(CannedMatchService::replying(&[
            "```json\n{\"link\": \"magnet:?xt=urn:btih:BBB\", \"confidence\": 0.8}\n```",
        ]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Requeued {
                link: "magnet:?xt=urn:btih:BBB".to_string(),
                source: LinkSource::Ai,
            }
        );
        assert_eq!(service.calls(), 1);

        // 年份不同的条目不作为候选
        let queries = service.queries();
        assert!(queries[0].candidates.is_empty());
        assert_eq!(queries[0].known_links, vec!["magnet:?xt=urn:btih:AAA".to_string()]);
    }

    #[tokio::test]
    async fn test_retries_ai_until_new_link() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        let record = damage(&ctx, &a);

        // 第一次返回已有链接（大小写不同），第二次给出新链接
        let service = Arc::new(CannedMatchService::replying(&[
            r#"{"link": "magnet:?xt=urn:btih:aaa"}"#,
            r#"{"link": "ftp://b.com/farewell.mkv"}"#,
        ]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Requeued { .. }));
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn test_never_promotes_without_new_link() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        let record = damage(&ctx, &a);

        let service = Arc::new(CannedMatchService::replying(&[
            "抱歉，我找不到",
            r#"{"link": "https://pan.example.com/s/abc"}"#,
            r#"{"link": "magnet:?xt=urn:btih:CCC"}"#,
        ]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        let RepairOutcome::Failed { reason } = outcome else {
            panic!("expected failure");
        };
        assert!(reason.contains("不支持的链接类型"));
        // 调用次数受 max_ai_calls 限制
        assert_eq!(service.calls() as u32, ctx.config.repair.max_ai_calls);

        let record = ctx.store.get(&a).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.links.len(), 1);
        assert_eq!(record.repair_count, 0);
    }

    #[tokio::test]
    async fn test_repair_bound_stops_loop() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        for i in 0..ctx.config.repair.max_repair_attempts {
            let link = DownloadLink::parse(&format!("ftp://m/{}.mkv", i), LinkSource::Catalog).unwrap();
            ctx.store.requeue_with_link(&a, &link).unwrap();
        }
        let record = damage(&ctx, &a);

        let service = Arc::new(CannedMatchService::replying(&[r#"{"link": "magnet:?xt=urn:btih:NEW"}"#]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Failed { .. }));
        assert_eq!(service.calls(), 0);
        assert_eq!(
            ctx.store.get(&a).unwrap().unwrap().status,
            RecordStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_without_service_marks_failed() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        let b = seed(&ctx, "b", "活着", Some(1994), &["magnet:?xt=urn:btih:BBB"]);
        damage(&ctx, &a);

        let matcher = RepairMatcher::new(ctx.clone(), None);
        let report = matcher.repair_damaged().await.unwrap();
        assert_eq!(report.failed, vec![a.clone()]);
        assert!(report.requeued.is_empty());

        let failed = ctx.store.get(&a).unwrap().unwrap();
        assert!(failed.last_error.unwrap().contains("未找到可替换链接"));
        // 未损坏的记录不受影响
        assert_eq!(
            ctx.store.get(&b).unwrap().unwrap().status,
            RecordStatus::Discovered
        );
    }

    #[tokio::test]
    async fn test_candidates_passed_to_ai() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "蜘蛛侠：平行宇宙", Some(2018), &["magnet:?xt=urn:btih:AAA"]);
        seed(&ctx, "b", "蜘蛛侠：穿越平行宇宙", Some(2018), &["magnet:?xt=urn:btih:BBB"]);
        seed(&ctx, "c", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:CCC"]);
        let record = damage(&ctx, &a);

        let service = Arc::new(CannedMatchService::replying(&[r#"{"link": "magnet:?xt=urn:btih:BBB"}"#]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service.clone()));
        matcher.find_replacement(&record).await.unwrap();

        let queries = service.queries();
        assert_eq!(queries[0].candidates.len(), 1);
        assert_eq!(queries[0].candidates[0].link, "magnet:?xt=urn:btih:BBB");
    }

    #[tokio::test]
    async fn test_untried_links_requeued_before_searching() {
        let (ctx, dir) = test_context();
        let a = seed(
            &ctx,
            "a",
            "霸王别姬",
            Some(1993),
            &["magnet:?xt=urn:btih:AAA", "ftp://b.com/farewell.mkv"],
        );
        // 只有磁力链接下载过，产物损坏
        let path = dir.path().join("broken.mkv");
        std::fs::write(&path, b"broken").unwrap();
        let record = ctx
            .store
            .update_status(
                &a,
                StatusUpdate::to(RecordStatus::VerifiedDamaged)
                    .mark_tried("magnet:?xt=urn:btih:AAA")
                    .artifact(path.clone(), 6)
                    .error("时长低于阈值"),
            )
            .unwrap();

        let matcher = RepairMatcher::new(ctx.clone(), None);
        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert_eq!(outcome, RepairOutcome::Retry { untried: 1 });

        let record = ctx.store.get(&a).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::RepairPending);
        assert_eq!(record.links.len(), 2);
        assert_eq!(record.repair_count, 0);
        assert_eq!(
            record.untried_links().map(|l| l.url.as_str()).collect::<Vec<_>>(),
            vec!["ftp://b.com/farewell.mkv"]
        );
        assert!(!path.exists());

        let report = matcher.repair_damaged().await.unwrap();
        assert!(report.requeued.is_empty());
    }

    #[tokio::test]
    async fn test_replaced_artifact_removed_from_disk() {
        let (ctx, dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        let (record, path) = damage_with_file(&ctx, &a, dir.path());
        assert!(path.exists());

        let service = Arc::new(CannedMatchService::replying(&[r#"{"link": "magnet:?xt=urn:btih:BBB"}"#]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service));

        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Requeued { .. }));
        assert!(!path.exists());
        assert!(ctx.store.get(&a).unwrap().unwrap().artifact_path.is_none());
    }

    #[tokio::test]
    async fn test_failed_repair_keeps_artifact() {
        let (ctx, dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        let (record, path) = damage_with_file(&ctx, &a, dir.path());

        let matcher = RepairMatcher::new(ctx.clone(), None);
        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Failed { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unreachable_service_defers_repair() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        damage(&ctx, &a);

        let offline = Arc::new(CannedMatchService::offline());
        let matcher = RepairMatcher::new(ctx.clone(), Some(offline.clone()));
        let report = matcher.repair_damaged().await.unwrap();
        assert_eq!(report.deferred, vec![a.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(offline.calls() as u32, ctx.config.repair.max_ai_calls);

        let record = ctx.store.get(&a).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::VerifiedDamaged);
        assert_eq!(record.repair_count, 0);

        // 服务恢复后正常修复
        let service = Arc::new(CannedMatchService::replying(&[r#"{"link": "magnet:?xt=urn:btih:BBB"}"#]));
        let matcher = RepairMatcher::new(ctx.clone(), Some(service));
        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert!(matches!(outcome, RepairOutcome::Requeued { .. }));
    }

    #[tokio::test]
    async fn test_untried_links_requeued_even_at_repair_bound() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "霸王别姬", Some(1993), &["magnet:?xt=urn:btih:AAA"]);
        for i in 0..ctx.config.repair.max_repair_attempts {
            let link = DownloadLink::parse(&format!("ftp://m/{}.mkv", i), LinkSource::Catalog).unwrap();
            ctx.store.requeue_with_link(&a, &link).unwrap();
        }
        let record = ctx
            .store
            .update_status(
                &a,
                StatusUpdate::to(RecordStatus::VerifiedDamaged).mark_tried("magnet:?xt=urn:btih:AAA"),
            )
            .unwrap();

        let matcher = RepairMatcher::new(ctx.clone(), None);
        let outcome = matcher.find_replacement(&record).await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Retry {
                untried: ctx.config.repair.max_repair_attempts as usize
            }
        );
    }

    #[tokio::test]
    async fn test_skips_records_not_damaged() {
        let (ctx, _dir) = test_context();
        let a = seed(&ctx, "a", "活着", Some(1994), &["magnet:?xt=urn:btih:AAA"]);
        let record = ctx.store.get(&a).unwrap().unwrap();

        let matcher = RepairMatcher::new(ctx.clone(), None);
        assert_eq!(
            matcher.find_replacement(&record).await.unwrap(),
            RepairOutcome::Skipped
        );
    }
}
