// Movie Crawler Rust Library
// 电影抓取、下载、校验、修复流水线核心库

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 影片目录（SQLite）
pub mod catalog;

// 页面抓取模块
pub mod scraper;

// 下载引擎接口（aria2）
pub mod engine;

// 下载编排模块
pub mod downloader;

// 完整性检查模块
pub mod checker;

// 损坏记录修复模块
pub mod repair;

// 🔥 流水线编排
pub mod pipeline;

#[cfg(test)]
mod testing;

// 导出常用类型
pub use catalog::{CatalogStore, DownloadLink, LinkKind, LinkSource, MovieRecord, RecordStatus};
pub use checker::{IntegrityChecker, Threshold, Verdict};
pub use config::AppConfig;
pub use downloader::{DownloadOrchestrator, DownloadTask};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineContext};
pub use repair::{RepairMatcher, RepairOutcome};
pub use crate::scraper::PageScraper;
