//! `manifest` 来源：章节引用指向一个 JSON 清单，列出各页图片地址。
//!
//! 清单格式（两种均可）：
//! - 页面数组：`["001.jpg", "https://cdn.example.com/002.png"]`
//! - 对象：`{"pages": [...], "chapters": [{"title": "...", "url": "...", "chapter_number": 1}]}`
//!
//! 相对地址按清单自身的 URL 解析。

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use serde::Deserialize;

use super::{ChapterInfo, ContentCard, Scraper};

pub const SOURCE_ID: &str = "manifest";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    Pages(Vec<String>),
    Document {
        #[serde(default)]
        pages: Vec<String>,
        #[serde(default)]
        chapters: Vec<ManifestChapter>,
    },
}

#[derive(Debug, Deserialize)]
struct ManifestChapter {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    chapter_number: Option<f64>,
    #[serde(default)]
    uploaded_at_ts: Option<i64>,
}

pub struct ManifestScraper {
    client: Client,
}

impl ManifestScraper {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, */*"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    async fn fetch_manifest(&self, url: &str) -> Result<(Url, Manifest)> {
        let base = Url::parse(url.trim()).with_context(|| format!("invalid manifest url: {url}"))?;
        let resp = self
            .client
            .get(base.clone())
            .send()
            .await
            .with_context(|| format!("manifest request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("manifest request rejected: {url}"))?;
        let manifest = resp
            .json::<Manifest>()
            .await
            .with_context(|| format!("manifest is not valid json: {url}"))?;
        Ok((base, manifest))
    }
}

impl Default for ManifestScraper {
    fn default() -> Self {
        Self::new()
    }
}

fn absolutize(base: &Url, reference: &str) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(anyhow!("empty page reference in manifest"));
    }
    base.join(reference)
        .map(|u| u.to_string())
        .with_context(|| format!("bad page reference: {reference}"))
}

#[async_trait]
impl Scraper for ManifestScraper {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    async fn search(&self, _query: &str, _page: u32) -> Result<Vec<ContentCard>> {
        Ok(Vec::new())
    }

    async fn chapters(&self, content_url: &str) -> Result<Vec<ChapterInfo>> {
        let (base, manifest) = self.fetch_manifest(content_url).await?;
        let chapters = match manifest {
            Manifest::Pages(_) => Vec::new(),
            Manifest::Document { chapters, .. } => chapters,
        };
        chapters
            .into_iter()
            .map(|c| {
                Ok(ChapterInfo {
                    title: c.title,
                    url: absolutize(&base, &c.url)?,
                    chapter_number: c.chapter_number,
                    uploaded_at_ts: c.uploaded_at_ts,
                })
            })
            .collect()
    }

    async fn pages(&self, chapter_url: &str) -> Result<Vec<String>> {
        let (base, manifest) = self.fetch_manifest(chapter_url).await?;
        let pages = match manifest {
            Manifest::Pages(p) => p,
            Manifest::Document { pages, .. } => pages,
        };
        pages.iter().map(|p| absolutize(&base, p)).collect()
    }
}
