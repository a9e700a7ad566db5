// 页面下载

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::ScraperConfig;
use crate::error::{PipelineError, Result};

/// 站点默认编码（响应头未声明 charset 时使用）
const DEFAULT_CHARSET: &str = "gbk";

/// 页面获取接口
///
/// 只负责单次请求，重试与限速由 `PageScraper` 处理
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// 基于 reqwest 的页面获取
pub struct HttpFetcher {
    client: Client,
    user_agents: Vec<String>,
}

impl HttpFetcher {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_store(true);

        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| PipelineError::Config(format!("代理地址无效: {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| PipelineError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            user_agents: config.user_agents.clone(),
        })
    }

    fn random_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or("Mozilla/5.0")
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let transient = |reason: String| PipelineError::TransientFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.random_user_agent())
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transient(format!("HTTP {}", status)));
        }

        let body = response
            .text_with_charset(DEFAULT_CHARSET)
            .await
            .map_err(|e| transient(format!("读取响应失败: {}", e)))?;

        debug!("页面获取成功: {} ({} 字符)", url, body.len());
        Ok(body)
    }
}
