// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::catalog::LinkKind;
use crate::error::PipelineError;

/// 应用配置
///
/// `repair` 段没有默认值（修复上限必须显式配置），因此整个配置也不提供 `Default`，
/// 首次使用请通过 `init` 命令生成示例配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 抓取配置
    #[serde(default)]
    pub scraper: ScraperConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 完整性检查配置
    #[serde(default)]
    pub checker: CheckerConfig,
    /// 修复配置
    pub repair: RepairConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 抓取
// =====================================================

/// 抓取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// 站点根地址（用于拼接相对链接）
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 列表页模板，`{page}` 会被替换为页码
    #[serde(default = "default_list_url_template")]
    pub list_url_template: String,
    /// 单次请求最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避基数（毫秒），第 n 次重试等待 base * 2^n
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 两次请求之间的间隔（毫秒）
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// 间隔抖动百分比
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u32,
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 随机选用的 User-Agent 列表
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
    /// 代理地址（http:// 或 socks5://）
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_base_url() -> String {
    "https://www.dytt8.com".to_string()
}

fn default_list_url_template() -> String {
    "https://www.dytt8.com/html/gndy/dyzz/list_23_{page}.html".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_request_delay_ms() -> u64 {
    1500
}

fn default_jitter_percent() -> u32 {
    30
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".to_string(),
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
    ]
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            list_url_template: default_list_url_template(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            request_delay_ms: default_request_delay_ms(),
            jitter_percent: default_jitter_percent(),
            timeout_secs: default_timeout_secs(),
            user_agents: default_user_agents(),
            proxy: None,
        }
    }
}

impl ScraperConfig {
    /// 第 `page` 页列表地址
    pub fn list_url(&self, page: u32) -> String {
        self.list_url_template.replace("{page}", &page.to_string())
    }
}

// =====================================================
// 下载
// =====================================================

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// aria2 JSON-RPC 地址
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// aria2 RPC 密钥（--rpc-secret）
    #[serde(default)]
    pub secret_token: Option<String>,
    /// 下载根目录，每部影片单独一个子目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最大同时下载数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 轮询间隔（秒）
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// 提交任务失败时的重试次数
    #[serde(default = "default_submit_retries")]
    pub submit_retries: u32,
    /// 链接优先级，靠前的类型优先尝试
    #[serde(default = "default_link_preference")]
    pub link_preference: Vec<LinkKind>,
}

fn default_rpc_url() -> String {
    "http://localhost:6800/jsonrpc".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_submit_retries() -> u32 {
    3
}

fn default_link_preference() -> Vec<LinkKind> {
    vec![LinkKind::Magnet, LinkKind::Protocol, LinkKind::Ftp]
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            secret_token: None,
            download_dir: default_download_dir(),
            max_concurrent: default_max_concurrent(),
            poll_interval_secs: default_poll_interval_secs(),
            submit_retries: default_submit_retries(),
            link_preference: default_link_preference(),
        }
    }
}

// =====================================================
// 完整性检查
// =====================================================

/// 完整性检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// 最小文件大小（GB），低于此值视为不完整
    #[serde(default = "default_min_size_gb")]
    pub min_size_gb: Option<f64>,
    /// 最小时长（秒）
    #[serde(default)]
    pub min_duration_secs: Option<f64>,
    /// 探测工具失败时的重试次数
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    /// 并发探测数
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
    /// ffprobe 可执行文件路径
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// ffmpeg 可执行文件路径（深度解码检查使用）
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// 是否完整解码一遍（慢，但能发现中间损坏）
    #[serde(default)]
    pub deep_scan: bool,
    /// 目录扫描时识别的视频扩展名
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

fn default_min_size_gb() -> Option<f64> {
    Some(1.0)
}

fn default_probe_retries() -> u32 {
    2
}

fn default_probe_workers() -> usize {
    2
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "avi", "mkv", "mov", "wmv", "flv", "rmvb"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            min_size_gb: default_min_size_gb(),
            min_duration_secs: None,
            probe_retries: default_probe_retries(),
            probe_workers: default_probe_workers(),
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_path: default_ffmpeg_path(),
            deep_scan: false,
            video_extensions: default_video_extensions(),
        }
    }
}

// =====================================================
// 修复
// =====================================================

/// 修复配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// 单条记录最多修复次数（必填）
    pub max_repair_attempts: u32,
    /// 单条记录每轮最多调用 AI 次数
    #[serde(default = "default_max_ai_calls")]
    pub max_ai_calls: u32,
    /// 两次 AI 调用之间的最小间隔（毫秒）
    #[serde(default = "default_min_call_interval_ms")]
    pub min_call_interval_ms: u64,
    /// AI 匹配服务
    #[serde(default)]
    pub ai: AiConfig,
}

fn default_max_ai_calls() -> u32 {
    2
}

fn default_min_call_interval_ms() -> u64 {
    2000
}

/// OpenAI 兼容接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// 是否启用 AI 匹配
    #[serde(default = "default_ai_enabled")]
    pub enabled: bool,
    /// 接口根地址（包含 /v1）
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ai_enabled() -> bool {
    true
}

fn default_ai_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_ai_model() -> String {
    "qwen2.5:72b".to_string()
}

fn default_ai_timeout_secs() -> u64 {
    60
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: default_ai_enabled(),
            base_url: default_ai_base_url(),
            api_key: String::new(),
            model: default_ai_model(),
            timeout_secs: default_ai_timeout_secs(),
        }
    }
}

// =====================================================
// 持久化 / 日志
// =====================================================

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite 数据库文件
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("db/movie.db")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

// =====================================================
// 加载 / 保存
// =====================================================

impl AppConfig {
    /// 示例配置（`init` 命令写出）
    pub fn sample() -> Self {
        Self {
            scraper: ScraperConfig::default(),
            download: DownloadConfig::default(),
            checker: CheckerConfig::default(),
            repair: RepairConfig {
                max_repair_attempts: 3,
                max_ai_calls: default_max_ai_calls(),
                min_call_interval_ms: default_min_call_interval_ms(),
                ai: AiConfig::default(),
            },
            persistence: PersistenceConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// 校验取值范围
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if !self.scraper.list_url_template.contains("{page}") {
            return Err(PipelineError::Config(format!(
                "scraper.list_url_template 缺少 {{page}} 占位符: {}",
                self.scraper.list_url_template
            )));
        }
        if self.download.max_concurrent == 0 {
            return Err(PipelineError::Config(
                "download.max_concurrent 必须大于 0".to_string(),
            ));
        }
        if self.download.link_preference.is_empty() {
            return Err(PipelineError::Config(
                "download.link_preference 不能为空".to_string(),
            ));
        }
        if self.checker.probe_workers == 0 {
            return Err(PipelineError::Config(
                "checker.probe_workers 必须大于 0".to_string(),
            ));
        }
        if self.checker.min_size_gb.is_none() && self.checker.min_duration_secs.is_none() {
            return Err(PipelineError::Config(
                "checker.min_size_gb 与 checker.min_duration_secs 至少需要配置一个".to_string(),
            ));
        }
        if self.repair.ai.enabled && self.repair.ai.base_url.trim().is_empty() {
            return Err(PipelineError::Config(
                "repair.ai.base_url 不能为空".to_string(),
            ));
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("创建配置目录失败")?;
            }
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {}", path))?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let config = AppConfig::sample();
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.repair.max_repair_attempts, 3);
        assert_eq!(loaded.scraper.max_retries, 5);
        assert_eq!(
            loaded.download.link_preference,
            vec![LinkKind::Magnet, LinkKind::Protocol, LinkKind::Ftp]
        );
    }

    #[test]
    fn test_repair_bound_is_required() {
        let result: std::result::Result<AppConfig, _> = toml::from_str("[repair]\nmax_ai_calls = 1\n");
        assert!(result.is_err());

        let config: AppConfig = toml::from_str("[repair]\nmax_repair_attempts = 4\n").unwrap();
        assert_eq!(config.repair.max_repair_attempts, 4);
        assert_eq!(config.download.rpc_url, "http://localhost:6800/jsonrpc");
        assert_eq!(config.checker.min_size_gb, Some(1.0));
    }

    #[test]
    fn test_link_preference_override() {
        let config: AppConfig = toml::from_str(
            "[download]\nlink_preference = [\"ftp\", \"magnet\"]\n\n[repair]\nmax_repair_attempts = 1\n",
        )
        .unwrap();
        assert_eq!(
            config.download.link_preference,
            vec![LinkKind::Ftp, LinkKind::Magnet]
        );
    }

    #[test]
    fn test_validate() {
        let mut config = AppConfig::sample();
        assert!(config.validate().is_ok());

        config.scraper.list_url_template = "https://a.com/list.html".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = AppConfig::sample();
        config.checker.min_size_gb = None;
        config.checker.min_duration_secs = None;
        assert!(config.validate().is_err());

        config.checker.min_duration_secs = Some(3600.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_list_url() {
        let config = ScraperConfig::default();
        assert_eq!(
            config.list_url(2),
            "https://www.dytt8.com/html/gndy/dyzz/list_23_2.html"
        );
    }
}
