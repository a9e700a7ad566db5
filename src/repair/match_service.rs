//! AI 匹配服务
//!
//! 通过 OpenAI 兼容的 /chat/completions 接口为损坏的电影寻找替代下载链接。
//! 返回内容不可信，由调用方解析校验

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::AiConfig;
use crate::error::{PipelineError, Result};

const SYSTEM_PROMPT: &str = "你是一个电影专家，负责为下载失败或文件损坏的电影寻找可用的替代下载链接。\n\
用户会给出电影名称、年份、已经尝试过的链接，以及目录中名称相近的候选条目。\n\
如果某个候选条目和目标是同一部电影（译名不同、带副标题、年份缺失都可能是同一部），返回该候选的链接；\n\
否则可以给出你确信可用的磁力链接。\n\
只返回一个 JSON 对象，不要任何解释：{\"link\": \"...\", \"title\": \"...\", \"confidence\": 0.0}\n\
找不到时返回 {\"link\": null}。\n\
例如：\n\
《蜘蛛侠：平行宇宙》(2018) 和 《蜘蛛侠：穿越平行宇宙》(2018) -> 同一部\n\
《流浪地球》(2019) 和 《流浪地球2》(2023) -> 不是同一部";

/// 目录中名称相近的候选条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub title: String,
    pub year: Option<u16>,
    pub link: String,
}

/// 匹配请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchQuery {
    pub title: String,
    pub year: Option<u16>,
    /// 记录上已有的链接（不能再返回）
    pub known_links: Vec<String>,
    pub candidates: Vec<MatchCandidate>,
}

impl MatchQuery {
    /// 用户消息
    pub fn prompt(&self) -> String {
        let year = |y: Option<u16>| y.map(|y| y.to_string()).unwrap_or_else(|| "未知年份".to_string());

        let mut prompt = format!("目标电影：《{}》({})\n", self.title, year(self.year));

        if !self.known_links.is_empty() {
            prompt.push_str("已尝试的链接：\n");
            for link in &self.known_links {
                prompt.push_str(&format!("- {}\n", link));
            }
        }

        if self.candidates.is_empty() {
            prompt.push_str("目录中没有名称相近的候选条目。\n");
        } else {
            prompt.push_str("候选条目：\n");
            for (i, c) in self.candidates.iter().enumerate() {
                prompt.push_str(&format!("{}. 《{}》({}) {}\n", i + 1, c.title, year(c.year), c.link));
            }
        }
        prompt
    }
}

/// 外部匹配服务
#[async_trait]
pub trait MatchService: Send + Sync {
    /// 返回原始文本，由调用方解析
    async fn suggest(&self, query: &MatchQuery) -> Result<String>;
}

/// 解析后的建议
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Suggestion {
    pub link: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// 解析 AI 回复
///
/// 容忍 ```json 代码块和前后多余文字，只取第一个 `{` 到最后一个 `}` 之间的内容
pub fn parse_suggestion(raw: &str) -> Result<Suggestion> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(PipelineError::InvalidAiResponse(format!(
                "回复中没有 JSON 对象: {}",
                raw.trim()
            )))
        }
    };

    let parsed: RawSuggestion = serde_json::from_str(body)
        .map_err(|e| PipelineError::InvalidAiResponse(format!("JSON 解析失败: {}", e)))?;

    let link = parsed
        .link
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| PipelineError::MatchNotFound("AI 未给出链接".to_string()))?;

    Ok(Suggestion {
        link,
        title: parsed.title,
        confidence: parsed.confidence,
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI 兼容接口
pub struct OpenAiMatchService {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiMatchService {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("创建 AI 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl MatchService for OpenAiMatchService {
    async fn suggest(&self, query: &MatchQuery) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": query.prompt()},
            ],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| PipelineError::TransientFetch {
            url: self.endpoint.clone(),
            reason: format!("AI 服务请求失败: {}", e),
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::TransientFetch {
                url: self.endpoint.clone(),
                reason: format!("AI 服务暂不可用: HTTP {}", status),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::InvalidAiResponse(format!(
                "AI 服务返回 HTTP {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::InvalidAiResponse(format!("响应解析失败: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| PipelineError::InvalidAiResponse("响应中没有内容".to_string()))?;

        debug!("AI 回复: 《{}》: {}", query.title, content);
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // 本机未监听的端口，连接立即被拒绝
        let config = AiConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            timeout_secs: 2,
            ..AiConfig::default()
        };
        let service = OpenAiMatchService::new(&config).unwrap();
        let query = MatchQuery {
            title: "霸王别姬".to_string(),
            year: Some(1993),
            known_links: vec![],
            candidates: vec![],
        };

        let err = service.suggest(&query).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientFetch { .. }), "{}", err);
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_plain_json() {
        let s = parse_suggestion(r#"{"link": "magnet:?xt=urn:btih:ABC", "title": "流浪地球", "confidence": 0.9}"#)
            .unwrap();
        assert_eq!(s.link, "magnet:?xt=urn:btih:ABC");
        assert_eq!(s.title.as_deref(), Some("流浪地球"));
        assert_eq!(s.confidence, Some(0.9));
    }

    #[test]
    fn test_parse_code_fence() {
        let raw = "好的，结果如下：\n```json\n{\"link\": \" ftp://a.com/b.mkv \"}\n```";
        assert_eq!(parse_suggestion(raw).unwrap().link, "ftp://a.com/b.mkv");
    }

    #[test]
    fn test_parse_null_link_is_not_found() {
        assert!(matches!(
            parse_suggestion(r#"{"link": null}"#),
            Err(PipelineError::MatchNotFound(_))
        ));
        assert!(matches!(
            parse_suggestion(r#"{"link": "  "}"#),
            Err(PipelineError::MatchNotFound(_))
        ));
    }

    #[test]
    fn test_parse_garbage_is_invalid() {
        assert!(matches!(
            parse_suggestion("抱歉，我不知道"),
            Err(PipelineError::InvalidAiResponse(_))
        ));
        assert!(matches!(
            parse_suggestion("{link: magnet}"),
            Err(PipelineError::InvalidAiResponse(_))
        ));
    }

    #[test]
    fn test_prompt_lists_candidates() {
        let query = MatchQuery {
            title: "闻香识女人".to_string(),
            year: None,
            known_links: vec!["ftp://a/1.mkv".to_string()],
            candidates: vec![MatchCandidate {
                title: "闻香识女人".to_string(),
                year: Some(1992),
                link: "magnet:?xt=urn:btih:AAA".to_string(),
            }],
        };
        let prompt = query.prompt();
        assert!(prompt.contains("《闻香识女人》(未知年份)"));
        assert!(prompt.contains("- ftp://a/1.mkv"));
        assert!(prompt.contains("1. 《闻香识女人》(1992) magnet:?xt=urn:btih:AAA"));
    }
}
