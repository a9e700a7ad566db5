use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use movie_crawler::{
    config::LogConfig, logging, AppConfig, DownloadLink, LinkSource, Pipeline, RecordStatus,
    Threshold,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "movie-crawler", version, about = "电影抓取 / 下载 / 校验 / 修复流水线")]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, default_value = "config/app.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 生成示例配置文件
    Init {
        /// 覆盖已有配置
        #[arg(long)]
        force: bool,
    },
    /// 抓取列表页区间内的影片
    Scrape {
        #[arg(long, default_value_t = 1)]
        start: u32,
        #[arg(long, default_value_t = 1)]
        end: u32,
        /// 新影片直接加入下载队列
        #[arg(long)]
        enqueue: bool,
    },
    /// 下载待下载的影片，直到队列为空
    Download {
        /// 本次最多加入队列的新影片数
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 校验已下载的文件，或扫描指定目录
    Check {
        #[arg(long)]
        min_size_gb: Option<f64>,
        /// 最小时长（秒）
        #[arg(long)]
        min_duration: Option<f64>,
        /// 扫描目录（不指定时校验目录中 downloaded 状态的记录）
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// 为损坏的影片寻找替代链接
    Repair,
    /// 完整流水线
    Run {
        #[arg(long, default_value_t = 1)]
        start: u32,
        #[arg(long, default_value_t = 1)]
        end: u32,
        /// 不抓取，只处理目录中已有的记录
        #[arg(long)]
        skip_scrape: bool,
        #[arg(long, default_value_t = 3)]
        max_cycles: u32,
        #[arg(long)]
        min_size_gb: Option<f64>,
        #[arg(long)]
        min_duration: Option<f64>,
    },
    /// 列出目录中的记录
    List {
        /// 只列出该状态的记录
        #[arg(long)]
        status: Option<String>,
        /// 只导出下载链接
        #[arg(long)]
        links_only: bool,
    },
    /// 人工为记录补充下载链接
    AddLink { key: String, url: String },
}

/// 加载日志配置
///
/// 配置文件不存在或解析失败时使用默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

async fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    if !Path::new(path).exists() {
        bail!("配置文件不存在: {}，请先运行 `movie-crawler init`", path);
    }
    AppConfig::load_from_file(path).await
}

/// 命令行阈值优先，未指定的取配置
fn threshold(
    config: &AppConfig,
    min_size_gb: Option<f64>,
    min_duration: Option<f64>,
) -> anyhow::Result<Threshold> {
    let threshold = if min_size_gb.is_some() || min_duration.is_some() {
        Threshold::from_gb(min_size_gb, min_duration)
    } else {
        Threshold::from_config(&config.checker)
    };
    threshold.context("无效的检查阈值")
}

/// Ctrl+C 时取消
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，停止提交新任务...");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    if let Command::Init { force } = &cli.command {
        if Path::new(&cli.config).exists() && !force {
            bail!("配置文件已存在: {}（使用 --force 覆盖）", cli.config);
        }
        AppConfig::sample().save_to_file(&cli.config).await?;
        info!("✓ 已生成配置文件: {}", cli.config);
        return Ok(());
    }

    let config = load_config(&cli.config).await?;
    let pipeline = Pipeline::from_config(config).context("初始化流水线失败")?;
    let ctx = pipeline.context().clone();

    match cli.command {
        Command::Init { .. } => {}
        Command::Scrape {
            start,
            end,
            enqueue,
        } => {
            if start > end {
                bail!("起始页 {} 大于结束页 {}", start, end);
            }
            let report = pipeline.scraper().run(start..=end, enqueue).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Download { limit } => {
            let token = cancel_on_ctrl_c();
            let orchestrator = pipeline.orchestrator();
            orchestrator.reconcile().await?;
            orchestrator.enqueue_discovered(limit).await?;
            let report = orchestrator.run(token.clone()).await?;
            if report.cancelled {
                orchestrator.shutdown(false).await;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Check {
            min_size_gb,
            min_duration,
            dir,
        } => {
            let threshold = threshold(&ctx.config, min_size_gb, min_duration)?;
            match dir {
                Some(dir) => {
                    let results = pipeline.checker().scan_directory(&dir, &threshold).await?;
                    for (path, verdict) in &results {
                        let mark = if verdict.is_ok() { "OK     " } else { "DAMAGED" };
                        println!("{} {}", mark, path.display());
                    }
                    let damaged = results.iter().filter(|(_, v)| !v.is_ok()).count();
                    info!("扫描完成: {} 个文件, 损坏 {} 个", results.len(), damaged);
                }
                None => {
                    let report = pipeline.checker().verify_downloaded(&threshold).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Command::Repair => {
            let report = pipeline.matcher().repair_damaged().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run {
            start,
            end,
            skip_scrape,
            max_cycles,
            min_size_gb,
            min_duration,
        } => {
            if start > end {
                bail!("起始页 {} 大于结束页 {}", start, end);
            }
            let threshold = threshold(&ctx.config, min_size_gb, min_duration)?;
            let pages = (!skip_scrape).then_some(start..=end);
            let reports = pipeline
                .run(pages, &threshold, max_cycles, cancel_on_ctrl_c())
                .await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::List { status, links_only } => {
            if links_only {
                for (key, link) in ctx.store.export_links()? {
                    println!("{}\t{}\t{}", key, link.kind.as_str(), link.url);
                }
                return Ok(());
            }

            let records = match status {
                Some(s) => {
                    let status = RecordStatus::parse(&s)
                        .with_context(|| format!("未知状态: {}", s))?;
                    ctx.store.list_by_status(status)?
                }
                None => ctx.store.list_all()?,
            };
            for r in &records {
                println!(
                    "{}\t{}\t{}\t尝试={}\t修复={}\t链接={}/{}\t{}",
                    r.status,
                    r.display_name(),
                    r.key,
                    r.attempts,
                    r.repair_count,
                    r.tried_count(),
                    r.links.len(),
                    r.last_error.as_deref().unwrap_or("")
                );
            }
            for (status, count) in ctx.store.count_by_status()? {
                if count > 0 {
                    println!("# {}: {}", status, count);
                }
            }
        }
        Command::AddLink { key, url } => {
            let Some(link) = DownloadLink::parse(&url, LinkSource::Manual) else {
                bail!("不支持的链接类型: {}", url);
            };
            let _guard = ctx.locks.acquire(&key).await;
            let record = ctx
                .store
                .requeue_with_link(&key, &link)
                .with_context(|| format!("补充链接失败: {}", key))?;
            info!("✓ 已补充链接并重新排队: {}", record.display_name());
        }
    }

    if ctx.store.list_by_status(RecordStatus::Downloading)?.is_empty() {
        return Ok(());
    }
    warn!("仍有下载中的记录，下次启动时会自动接管");
    Ok(())
}
