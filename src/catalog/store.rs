//! 影片目录 SQLite 存储
//!
//! - movie_record: 每部影片一行（状态、计数、当前任务、产物）
//! - movie_link: 影片的有序下载链接，按 (record_key, normalized) 去重

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::types::{
    normalize_link, normalize_title, DownloadLink, LinkKind, LinkSource, MovieRecord, RecordDraft,
    RecordStatus, StatusUpdate, TaskBinding, UpsertOutcome,
};
use crate::error::{PipelineError, Result};

const RECORD_COLUMNS: &str = "record_key, title, normalized_title, year, detail_url, subtitle, \
     resolution, status, attempts, repair_count, last_error, task_gid, task_link, artifact_path, \
     artifact_size, duration_secs, discovered_at, updated_at";

/// 影片目录
pub struct CatalogStore {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Config(format!("创建数据库目录失败: {:?}: {}", parent, e))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;

        info!("影片目录已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库（测试与临时检查使用）
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS movie_record (
                record_key TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                normalized_title TEXT NOT NULL,
                year INTEGER,
                detail_url TEXT,
                subtitle TEXT,
                resolution TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                repair_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                task_gid TEXT,
                task_link TEXT,
                artifact_path TEXT,
                artifact_size INTEGER,
                duration_secs REAL,
                discovered_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_movie_record_status ON movie_record(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_movie_record_title ON movie_record(normalized_title);
            CREATE INDEX IF NOT EXISTS idx_movie_record_artifact ON movie_record(artifact_path);

            CREATE TABLE IF NOT EXISTS movie_link (
                record_key TEXT NOT NULL REFERENCES movie_record(record_key),
                normalized TEXT NOT NULL,
                url TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                tried INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (record_key, normalized)
            );
            "#,
        )?;

        debug!("影片目录表初始化完成");
        Ok(())
    }

    // ========================================================================
    // 写入
    // ========================================================================

    /// 写入抓取结果
    ///
    /// 已存在的记录只合并新链接，不改变状态；
    /// failed 记录合并到新链接时恢复为 pending_download
    pub fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err(PipelineError::InvalidRecord(format!(
                "标题为空: {}",
                draft.detail_url.as_deref().unwrap_or("-")
            )));
        }
        if draft.links.is_empty() {
            return Err(PipelineError::InvalidRecord(format!("没有下载链接: {}", title)));
        }

        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut key = draft.key();
        let mut existing = load_record(&tx, &key)?;

        // 没有详情页地址时，按 标题+年份 匹配已有记录
        if existing.is_none() && draft.detail_url.is_none() && draft.year.is_some() {
            let matched: Option<String> = tx
                .query_row(
                    "SELECT record_key FROM movie_record WHERE normalized_title = ?1 AND year = ?2 \
                     ORDER BY discovered_at LIMIT 1",
                    params![normalize_title(title), draft.year],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(matched) = matched {
                existing = load_record(&tx, &matched)?;
                key = matched;
            }
        }

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO movie_record (record_key, title, normalized_title, year, detail_url, \
                     subtitle, resolution, status, discovered_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        key,
                        title,
                        normalize_title(title),
                        draft.year,
                        draft.detail_url,
                        draft.subtitle,
                        draft.resolution,
                        RecordStatus::Discovered.as_str(),
                        now,
                    ],
                )?;

                let mut seen = Vec::new();
                for link in &draft.links {
                    let normalized = link.normalized();
                    if seen.contains(&normalized) {
                        continue;
                    }
                    insert_link(&tx, &key, link, seen.len() as i64, now)?;
                    seen.push(normalized);
                }

                UpsertOutcome::Inserted { key }
            }
            Some(record) => {
                let mut known: Vec<String> = record.links.iter().map(|l| l.normalized()).collect();
                let mut position = record.links.len() as i64;
                let mut new_links = 0;

                for link in &draft.links {
                    let normalized = link.normalized();
                    if known.contains(&normalized) {
                        continue;
                    }
                    insert_link(&tx, &key, link, position, now)?;
                    known.push(normalized);
                    position += 1;
                    new_links += 1;
                }

                // 补全缺失的元数据
                let filled = tx.execute(
                    "UPDATE movie_record SET \
                        year = COALESCE(year, ?2), \
                        subtitle = COALESCE(subtitle, ?3), \
                        resolution = COALESCE(resolution, ?4) \
                     WHERE record_key = ?1 AND ( \
                        (year IS NULL AND ?2 IS NOT NULL) OR \
                        (subtitle IS NULL AND ?3 IS NOT NULL) OR \
                        (resolution IS NULL AND ?4 IS NOT NULL))",
                    params![key, draft.year, draft.subtitle, draft.resolution],
                )?;

                let revived = new_links > 0 && record.status == RecordStatus::Failed;
                if revived {
                    tx.execute(
                        "UPDATE movie_record SET status = ?2 WHERE record_key = ?1",
                        params![key, RecordStatus::PendingDownload.as_str()],
                    )?;
                }

                if new_links > 0 || filled > 0 {
                    tx.execute(
                        "UPDATE movie_record SET updated_at = ?2 WHERE record_key = ?1",
                        params![key, now],
                    )?;
                }

                if new_links > 0 {
                    UpsertOutcome::Merged {
                        key,
                        new_links,
                        revived,
                    }
                } else {
                    UpsertOutcome::Unchanged { key }
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// 更新状态（状态、计数、错误、任务、产物的唯一修改入口）
    pub fn update_status(&self, key: &str, update: StatusUpdate) -> Result<MovieRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let record = load_record(&tx, key)?.ok_or_else(|| PipelineError::NotFound(key.to_string()))?;

        let attempts = record.attempts + u32::from(update.count_attempt);
        let last_error = if update.status == RecordStatus::VerifiedOk {
            None
        } else {
            update.error.or(record.last_error)
        };
        let (task_gid, task_link) = match update.task {
            TaskBinding::Keep => (record.task_gid, record.task_link),
            TaskBinding::Bind { gid, link } => (Some(gid), Some(link)),
            TaskBinding::Clear => (None, None),
        };
        let (artifact_path, artifact_size) = match update.artifact {
            Some((path, size)) => (Some(path), Some(size)),
            None => (record.artifact_path, record.artifact_size),
        };
        let duration_secs = update.duration_secs.or(record.duration_secs);

        tx.execute(
            "UPDATE movie_record SET status = ?2, attempts = ?3, last_error = ?4, task_gid = ?5, \
             task_link = ?6, artifact_path = ?7, artifact_size = ?8, duration_secs = ?9, updated_at = ?10 \
             WHERE record_key = ?1",
            params![
                key,
                update.status.as_str(),
                attempts,
                last_error,
                task_gid,
                task_link,
                artifact_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                artifact_size.map(|s| s as i64),
                duration_secs,
                now_millis(),
            ],
        )?;

        if let Some(url) = &update.mark_tried {
            tx.execute(
                "UPDATE movie_link SET tried = 1 WHERE record_key = ?1 AND normalized = ?2",
                params![key, normalize_link(url)],
            )?;
        }

        let updated = load_record(&tx, key)?.ok_or_else(|| PipelineError::NotFound(key.to_string()))?;
        tx.commit()?;

        debug!(
            "记录状态更新: {} {} -> {}",
            key, record.status, updated.status
        );
        Ok(updated)
    }

    /// 追加新链接并重新排队（修复与人工补链的唯一入口）
    ///
    /// 链接已存在时返回 `InvalidRecord`，记录不会被推进
    pub fn requeue_with_link(&self, key: &str, link: &DownloadLink) -> Result<MovieRecord> {
        self.requeue_inner(key, Some(link))
    }

    /// 不追加链接，用记录自身剩余的未尝试链接重新排队（不计入修复次数）
    ///
    /// 没有未尝试的链接时返回 `InvalidRecord`
    pub fn requeue(&self, key: &str) -> Result<MovieRecord> {
        self.requeue_inner(key, None)
    }

    fn requeue_inner(&self, key: &str, link: Option<&DownloadLink>) -> Result<MovieRecord> {
        let now = now_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let record = load_record(&tx, key)?.ok_or_else(|| PipelineError::NotFound(key.to_string()))?;

        if record.status == RecordStatus::Downloading {
            return Err(PipelineError::InvalidRecord(format!(
                "记录正在下载中，不能重新排队: {}",
                key
            )));
        }

        let mut repair_count = record.repair_count;
        match link {
            Some(link) => {
                if record.has_link(&link.url) {
                    return Err(PipelineError::InvalidRecord(format!(
                        "链接已存在: {}",
                        link.url
                    )));
                }
                let mut fresh = link.clone();
                fresh.tried = false;
                insert_link(&tx, key, &fresh, record.links.len() as i64, now)?;
                repair_count += u32::from(link.source.counts_as_repair());
            }
            None => {
                if record.untried_links().next().is_none() {
                    return Err(PipelineError::InvalidRecord(format!(
                        "没有未尝试的链接: {}",
                        key
                    )));
                }
            }
        }

        tx.execute(
            "UPDATE movie_record SET status = ?2, repair_count = ?3, last_error = NULL, \
             task_gid = NULL, task_link = NULL, artifact_path = NULL, artifact_size = NULL, \
             duration_secs = NULL, updated_at = ?4 WHERE record_key = ?1",
            params![key, RecordStatus::RepairPending.as_str(), repair_count, now],
        )?;

        let updated = load_record(&tx, key)?.ok_or_else(|| PipelineError::NotFound(key.to_string()))?;
        tx.commit()?;

        match link {
            Some(link) => info!(
                "记录已补充链接并重新排队: {} (来源={}, 修复次数={})",
                key,
                link.source.as_str(),
                updated.repair_count
            ),
            None => info!(
                "记录使用剩余链接重新排队: {} (未尝试 {} 个)",
                key,
                updated.untried_links().count()
            ),
        }
        Ok(updated)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn get(&self, key: &str) -> Result<Option<MovieRecord>> {
        let conn = self.conn.lock();
        Ok(load_record(&conn, key)?)
    }

    /// 指定状态的记录（按发现时间排序）
    pub fn list_by_status(&self, status: RecordStatus) -> Result<Vec<MovieRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM movie_record WHERE status = ?1 ORDER BY discovered_at, record_key",
            RECORD_COLUMNS
        );
        Ok(query_records(&conn, &sql, params![status.as_str()])?)
    }

    pub fn list_all(&self) -> Result<Vec<MovieRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM movie_record ORDER BY discovered_at, record_key",
            RECORD_COLUMNS
        );
        Ok(query_records(&conn, &sql, [])?)
    }

    /// 各状态记录数（包含数量为 0 的状态）
    pub fn count_by_status(&self) -> Result<Vec<(RecordStatus, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM movie_record GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RecordStatus::ALL
            .iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map(|(_, c)| *c as u64)
                    .unwrap_or(0);
                (*status, count)
            })
            .collect())
    }

    /// 导出全部链接（记录顺序 + 链接顺序）
    pub fn export_links(&self) -> Result<Vec<(String, DownloadLink)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT l.record_key, l.url, l.kind, l.source, l.tried FROM movie_link l \
             JOIN movie_record r ON r.record_key = l.record_key \
             ORDER BY r.discovered_at, r.record_key, l.position",
        )?;
        let links = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, link_from_columns(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// 标题归一化后相同的记录
    pub fn find_by_normalized_title(&self, title: &str) -> Result<Vec<MovieRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM movie_record WHERE normalized_title = ?1 ORDER BY discovered_at, record_key",
            RECORD_COLUMNS
        );
        Ok(query_records(&conn, &sql, params![normalize_title(title)])?)
    }

    /// 按下载产物路径查找记录
    pub fn find_by_artifact_path(&self, path: &Path) -> Result<Option<MovieRecord>> {
        let conn = self.conn.lock();
        let key: Option<String> = conn
            .query_row(
                "SELECT record_key FROM movie_record WHERE artifact_path = ?1 LIMIT 1",
                params![path.to_string_lossy().to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match key {
            Some(key) => Ok(load_record(&conn, &key)?),
            None => Ok(None),
        }
    }
}

// ============================================================================
// 行映射
// ============================================================================

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn insert_link(
    conn: &Connection,
    key: &str,
    link: &DownloadLink,
    position: i64,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO movie_link (record_key, normalized, url, kind, source, tried, position, added_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            key,
            link.normalized(),
            link.url,
            link.kind.as_str(),
            link.source.as_str(),
            link.tried,
            position,
            now,
        ],
    )?;
    Ok(())
}

/// 从 `url, kind, source, tried` 四列（起始下标 `start`）构造链接
fn link_from_columns(row: &Row<'_>, start: usize) -> rusqlite::Result<DownloadLink> {
    let kind: String = row.get(start + 1)?;
    let source: String = row.get(start + 2)?;
    Ok(DownloadLink {
        url: row.get(start)?,
        kind: LinkKind::parse(&kind)
            .ok_or_else(|| conversion_error(start + 1, format!("未知链接类型: {}", kind)))?,
        source: LinkSource::parse(&source),
        tried: row.get(start + 3)?,
    })
}

fn load_links(conn: &Connection, key: &str) -> rusqlite::Result<Vec<DownloadLink>> {
    let mut stmt = conn.prepare(
        "SELECT url, kind, source, tried FROM movie_link WHERE record_key = ?1 ORDER BY position",
    )?;
    let links = stmt
        .query_map(params![key], |row| link_from_columns(row, 0))?
        .collect();
    links
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MovieRecord> {
    let status: String = row.get(7)?;
    let artifact_path: Option<String> = row.get(13)?;
    let artifact_size: Option<i64> = row.get(14)?;

    Ok(MovieRecord {
        key: row.get(0)?,
        title: row.get(1)?,
        normalized_title: row.get(2)?,
        year: row.get(3)?,
        detail_url: row.get(4)?,
        subtitle: row.get(5)?,
        resolution: row.get(6)?,
        links: Vec::new(),
        status: RecordStatus::parse(&status)
            .ok_or_else(|| conversion_error(7, format!("未知记录状态: {}", status)))?,
        attempts: row.get(8)?,
        repair_count: row.get(9)?,
        last_error: row.get(10)?,
        task_gid: row.get(11)?,
        task_link: row.get(12)?,
        artifact_path: artifact_path.map(PathBuf::from),
        artifact_size: artifact_size.map(|s| s as u64),
        duration_secs: row.get(15)?,
        discovered_at: from_millis(row.get(16)?),
        updated_at: from_millis(row.get(17)?),
    })
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<MovieRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut records = stmt
        .query_map(params, record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for record in &mut records {
        record.links = load_links(conn, &record.key)?;
    }
    Ok(records)
}

fn load_record(conn: &Connection, key: &str) -> rusqlite::Result<Option<MovieRecord>> {
    let sql = format!("SELECT {} FROM movie_record WHERE record_key = ?1", RECORD_COLUMNS);
    let record = conn
        .query_row(&sql, params![key], record_from_row)
        .optional()?;
    match record {
        Some(mut record) => {
            record.links = load_links(conn, key)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}
