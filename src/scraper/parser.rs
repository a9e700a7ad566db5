//! 列表页与详情页解析
//!
//! 列表页：`div.co_content8` 内的详情链接（跳过 `list_` 开头的分页链接）
//! 详情页：标题取 `div.title_all h1`，缺失时取 `<title>`；
//! 片名取《》之间的内容，年份取 `xxxx年`，下载链接按文档顺序收集

use regex::Regex;
use reqwest::Url;
use ::scraper::{Html, Selector};

use crate::catalog::{DownloadLink, LinkSource, RecordDraft};
use crate::error::{PipelineError, Result};

/// 字幕标记（按优先级）
const SUBTITLE_MARKERS: &[&str] = &["中英双字", "中英字幕", "国语中字", "BD", "HD"];

/// 分辨率标记（按优先级）
const RESOLUTION_MARKERS: &[&str] = &["1080P", "HD", "BD"];

/// 列表页条目
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    /// 详情页绝对地址
    pub url: String,
    /// 列表中显示的标题
    pub label: String,
}

/// 页面解析器（选择器与正则只编译一次）
pub struct PageParser {
    listing_anchor: Selector,
    title_heading: Selector,
    page_title: Selector,
    anchor: Selector,
    name_pattern: Regex,
    year_pattern: Regex,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| PipelineError::Config(format!("选择器无效 {}: {:?}", css, e)))
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("正则无效 {}: {}", pattern, e)))
}

impl PageParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            listing_anchor: selector("div.co_content8 a[href]")?,
            title_heading: selector("div.title_all h1")?,
            page_title: selector("title")?,
            anchor: selector("a[href]")?,
            name_pattern: regex(r"《(.*?)》")?,
            year_pattern: regex(r"(\d{4})年")?,
        })
    }

    /// 解析列表页，返回详情页地址（去重，保持顺序）
    pub fn parse_listing(&self, html: &str, page_url: &str) -> Vec<ListingEntry> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        let mut entries: Vec<ListingEntry> = Vec::new();

        for anchor in document.select(&self.listing_anchor) {
            let href = anchor.value().attr("href").unwrap_or("").trim();
            if href.is_empty()
                || href.starts_with("list")
                || href.starts_with('#')
                || href.starts_with("javascript:")
            {
                continue;
            }

            let url = match &base {
                Some(base) => match base.join(href) {
                    Ok(url) => url.to_string(),
                    Err(_) => continue,
                },
                None => href.to_string(),
            };

            if entries.iter().any(|e| e.url == url) {
                continue;
            }

            entries.push(ListingEntry {
                url,
                label: anchor.text().collect::<String>().trim().to_string(),
            });
        }

        entries
    }

    /// 解析详情页
    ///
    /// 缺片名或缺下载链接时返回 `InvalidRecord`
    pub fn parse_detail(&self, html: &str, detail_url: &str) -> Result<RecordDraft> {
        let document = Html::parse_document(html);

        let full_title = document
            .select(&self.title_heading)
            .map(|h1| h1.text().collect::<String>())
            .find(|t| !t.trim().is_empty())
            .or_else(|| {
                document
                    .select(&self.page_title)
                    .next()
                    .map(|t| t.text().collect::<String>())
            })
            .unwrap_or_default();

        let title = self
            .name_pattern
            .captures(&full_title)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                PipelineError::InvalidRecord(format!("未找到片名: {}", detail_url))
            })?;

        let year = self
            .year_pattern
            .captures(&full_title)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok());

        let subtitle = first_marker(&full_title, SUBTITLE_MARKERS);
        let resolution = first_marker(&full_title, RESOLUTION_MARKERS);

        let mut links: Vec<DownloadLink> = Vec::new();
        for anchor in document.select(&self.anchor) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(link) = DownloadLink::parse(href, LinkSource::Scrape) else {
                continue;
            };
            if !links.iter().any(|l| l.normalized() == link.normalized()) {
                links.push(link);
            }
        }

        if links.is_empty() {
            return Err(PipelineError::InvalidRecord(format!(
                "没有下载链接: 《{}》 {}",
                title, detail_url
            )));
        }

        Ok(RecordDraft {
            title,
            year,
            detail_url: Some(detail_url.to_string()),
            subtitle,
            resolution,
            links,
        })
    }
}

fn first_marker(text: &str, markers: &[&str]) -> Option<String> {
    markers
        .iter()
        .find(|marker| text.contains(*marker))
        .map(|marker| marker.to_string())
}
