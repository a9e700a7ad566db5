//! 流水线错误类型
//!
//! 每个阶段自行处理自己的瞬时错误，终态失败写回记录（状态 + 最后错误），
//! 不会从流水线中未捕获地抛出

use thiserror::Error;

/// 流水线错误
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 网络/页面错误，可按退避策略重试
    #[error("页面抓取失败: {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// 抓取结果不完整（缺标题或缺链接），跳过且不入库
    #[error("无效记录: {0}")]
    InvalidRecord(String),

    /// 下载引擎不可达或拒绝任务
    #[error("下载引擎错误: {0}")]
    Engine(String),

    /// 媒体探测工具本身失败（区别于文件损坏）
    #[error("媒体探测失败: {0}")]
    Probe(String),

    /// 修复阶段找不到可替换链接
    #[error("未找到可替换链接: {0}")]
    MatchNotFound(String),

    /// AI 返回内容格式不合法
    #[error("AI 返回内容无效: {0}")]
    InvalidAiResponse(String),

    /// 记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Storage(#[from] rusqlite::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl PipelineError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientFetch { .. } | PipelineError::Engine(_) | PipelineError::Probe(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let fetch = PipelineError::TransientFetch {
            url: "http://a".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(fetch.is_transient());
        assert!(PipelineError::Engine("rpc down".to_string()).is_transient());
        assert!(!PipelineError::InvalidRecord("no links".to_string()).is_transient());
        assert!(!PipelineError::NotFound("k".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::NotFound("url:http://a/1.html".to_string());
        assert_eq!(err.to_string(), "记录不存在: url:http://a/1.html");
    }
}
