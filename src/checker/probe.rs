//! 媒体探测
//!
//! ffprobe 读取容器信息（时长、视频流），可选 ffmpeg 完整解码一遍发现中段损坏

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Output;
use tracing::debug;

use crate::config::CheckerConfig;
use crate::error::{PipelineError, Result};

/// 探测结果
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// 时长（秒），容器未记录时为 None
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    /// 是否可以正常解码
    pub playable: bool,
    /// 不可播放时的错误输出
    pub detail: Option<String>,
}

/// 媒体探测接口
///
/// 探测工具本身失败（找不到、崩溃、输出无法解析）返回 `PipelineError::Probe`，
/// 文件损坏通过 `playable = false` 表示
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// ffprobe / ffmpeg 探测
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
    ffmpeg_path: PathBuf,
    deep_scan: bool,
}

impl FfprobeProbe {
    pub fn new(config: &CheckerConfig) -> Self {
        Self {
            ffprobe_path: config.ffprobe_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            deep_scan: config.deep_scan,
        }
    }

    async fn run(program: &Path, args: &[&str], path: &Path) -> Result<Output> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .arg(path)
            .output()
            .await
            .map_err(|e| PipelineError::Probe(format!("无法启动 {:?}: {}", program, e)))?;

        // 被信号终止（崩溃）视为工具故障
        if output.status.code().is_none() {
            return Err(PipelineError::Probe(format!(
                "{:?} 异常退出: {}",
                program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    /// ffmpeg -v error -i <file> -f null -，有任何错误输出即视为损坏
    async fn decode_errors(&self, path: &Path) -> Result<Option<String>> {
        let output = tokio::process::Command::new(&self.ffmpeg_path)
            .args(["-nostdin", "-v", "error", "-i"])
            .arg(path)
            .args(["-f", "null", "-"])
            .output()
            .await
            .map_err(|e| PipelineError::Probe(format!("无法启动 {:?}: {}", self.ffmpeg_path, e)))?;

        if output.status.code().is_none() {
            return Err(PipelineError::Probe(format!(
                "{:?} 异常退出",
                self.ffmpeg_path
            )));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok(if stderr.is_empty() && output.status.success() {
            None
        } else {
            Some(truncate(&stderr, 500))
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// 解析 ffprobe JSON 输出：返回 (时长, 是否有视频流)
fn parse_ffprobe(stdout: &str) -> Result<(Option<f64>, bool)> {
    let parsed: FfprobeOutput = serde_json::from_str(stdout)
        .map_err(|e| PipelineError::Probe(format!("ffprobe 输出解析失败: {}", e)))?;

    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);
    let has_video = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("video"));

    Ok((duration, has_video))
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map_err(|e| PipelineError::Probe(format!("读取文件信息失败 {:?}: {}", path, e)))?
            .len();

        let output = Self::run(
            &self.ffprobe_path,
            &[
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ],
            path,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("ffprobe 报告错误: {:?}: {}", path, stderr);
            return Ok(ProbeReport {
                duration_secs: None,
                size_bytes,
                playable: false,
                detail: Some(truncate(&stderr, 500)),
            });
        }

        let (duration_secs, has_video) = parse_ffprobe(&String::from_utf8_lossy(&output.stdout))?;
        if !has_video {
            return Ok(ProbeReport {
                duration_secs,
                size_bytes,
                playable: false,
                detail: Some("没有视频流".to_string()),
            });
        }

        let detail = if self.deep_scan {
            self.decode_errors(path).await?
        } else {
            None
        };

        Ok(ProbeReport {
            duration_secs,
            size_bytes,
            playable: detail.is_none(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264"},
                {"index": 1, "codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"duration": "7012.480000", "size": "2147483648"}
        }"#;
        let (duration, has_video) = parse_ffprobe(json).unwrap();
        assert_eq!(duration, Some(7012.48));
        assert!(has_video);
    }

    #[test]
    fn test_parse_ffprobe_audio_only() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        let (duration, has_video) = parse_ffprobe(json).unwrap();
        assert_eq!(duration, None);
        assert!(!has_video);
    }

    #[test]
    fn test_parse_ffprobe_garbage() {
        assert!(matches!(
            parse_ffprobe("not json"),
            Err(PipelineError::Probe(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mkv");
        std::fs::write(&file, b"data").unwrap();

        let probe = FfprobeProbe {
            ffprobe_path: dir.path().join("no-such-ffprobe"),
            ffmpeg_path: dir.path().join("no-such-ffmpeg"),
            deep_scan: false,
        };
        assert!(matches!(
            probe.probe(&file).await,
            Err(PipelineError::Probe(_))
        ));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("损坏的帧数据", 2), "损坏...");
    }
}
