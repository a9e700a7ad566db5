//! aria2 JSON-RPC 客户端
//!
//! 只用到 aria2.addUri / aria2.tellStatus / aria2.remove 三个方法

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::{DownloadEngine, EngineFile, EngineTaskState, EngineTaskStatus};
use crate::config::DownloadConfig;
use crate::error::{PipelineError, Result};

/// tellStatus 需要的字段
const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "files",
    "errorMessage",
    "followedBy",
];

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    /// "GID xxx is not found"
    fn is_not_found(&self) -> bool {
        self.code == 1 && self.message.contains("not found")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    gid: String,
    status: String,
    #[serde(default)]
    total_length: Option<String>,
    #[serde(default)]
    completed_length: Option<String>,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    followed_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: String,
    length: String,
}

fn parse_len(value: Option<&str>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

impl From<RawStatus> for EngineTaskState {
    fn from(raw: RawStatus) -> Self {
        Self {
            gid: raw.gid,
            status: EngineTaskStatus::parse(&raw.status),
            total_length: parse_len(raw.total_length.as_deref()),
            completed_length: parse_len(raw.completed_length.as_deref()),
            files: raw
                .files
                .into_iter()
                .map(|f| EngineFile {
                    path: PathBuf::from(f.path),
                    length: parse_len(Some(f.length.as_str())),
                })
                .collect(),
            error_message: raw.error_message.filter(|m| !m.is_empty()),
            followed_by: raw.followed_by,
        }
    }
}

/// 迅雷链接解码：thunder://base64("AA" + 原始地址 + "ZZ")
///
/// 其他链接原样返回
pub fn decode_thunder(link: &str) -> String {
    let Some(encoded) = link
        .strip_prefix("thunder://")
        .or_else(|| link.strip_prefix("THUNDER://"))
    else {
        return link.to_string();
    };

    let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim_end_matches('/')) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => return link.to_string(),
    };

    decoded
        .strip_prefix("AA")
        .and_then(|s| s.strip_suffix("ZZ"))
        .map(str::to_string)
        .unwrap_or_else(|| link.to_string())
}

/// aria2 RPC 客户端
pub struct Aria2Client {
    client: Client,
    rpc_url: String,
    secret_token: Option<String>,
    request_id: AtomicU64,
}

impl Aria2Client {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Config(format!("创建 aria2 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            secret_token: config.secret_token.clone().filter(|t| !t.is_empty()),
            request_id: AtomicU64::new(1),
        })
    }

    /// 构造 RPC 参数（有密钥时插入 token: 前缀参数）
    fn params(&self, mut params: Vec<Value>) -> Vec<Value> {
        if let Some(token) = &self.secret_token {
            params.insert(0, Value::String(format!("token:{}", token)));
        }
        params
    }

    /// 发送 RPC 请求，返回 result 或 RPC 错误
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<std::result::Result<Value, RpcError>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": format!("movie-crawler-{}", id),
            "method": method,
            "params": self.params(params),
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Engine(format!("{} 请求失败: {}", method, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::Engine(format!("{} 读取响应失败: {}", method, e)))?;

        debug!("aria2 {} 响应: status={}, body={}", method, status, text);

        let parsed: RpcResponse = serde_json::from_str(&text).map_err(|e| {
            PipelineError::Engine(format!("{} 响应解析失败 (HTTP {}): {}", method, status, e))
        })?;

        match (parsed.result, parsed.error) {
            (_, Some(error)) => Ok(Err(error)),
            (Some(result), None) => Ok(Ok(result)),
            (None, None) => Err(PipelineError::Engine(format!("{} 响应为空", method))),
        }
    }
}

#[async_trait]
impl DownloadEngine for Aria2Client {
    async fn add_uri(&self, uri: &str, dir: &Path) -> Result<String> {
        let uri = decode_thunder(uri);

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::Engine(format!("创建下载目录失败 {:?}: {}", dir, e)))?;

        let options = json!({ "dir": dir.to_string_lossy() });
        let result = self
            .call("aria2.addUri", vec![json!([uri]), options])
            .await?
            .map_err(|e| PipelineError::Engine(format!("aria2 拒绝任务: {} ({})", e.message, e.code)))?;

        let gid = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Engine(format!("aria2.addUri 返回值无效: {}", result)))?;

        info!("aria2 任务已提交: gid={}, dir={:?}", gid, dir);
        Ok(gid)
    }

    async fn tell_status(&self, gid: &str) -> Result<EngineTaskState> {
        let keys: Vec<Value> = STATUS_KEYS.iter().map(|k| json!(k)).collect();
        match self
            .call("aria2.tellStatus", vec![json!(gid), Value::Array(keys)])
            .await?
        {
            Ok(result) => {
                let raw: RawStatus = serde_json::from_value(result).map_err(|e| {
                    PipelineError::Engine(format!("aria2.tellStatus 返回值无效: {}", e))
                })?;
                Ok(raw.into())
            }
            Err(e) if e.is_not_found() => Ok(EngineTaskState::unknown(gid)),
            Err(e) => Err(PipelineError::Engine(format!(
                "查询任务失败 gid={}: {} ({})",
                gid, e.message, e.code
            ))),
        }
    }

    async fn remove(&self, gid: &str) -> Result<()> {
        match self.call("aria2.remove", vec![json!(gid)]).await? {
            Ok(_) => {
                info!("aria2 任务已取消: gid={}", gid);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(PipelineError::Engine(format!(
                "取消任务失败 gid={}: {} ({})",
                gid, e.message, e.code
            ))),
        }
    }
}
