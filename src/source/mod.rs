//! 内容来源（Scraper）能力接口与注册表。
//!
//! 每个来源按 source key（小写）注册；下载管理器只用到 `pages` / `resolve_image`
//! 以及请求头配置（User-Agent / Referer），站点 HTML 解析由各来源自行负责。

pub mod manifest;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentCard {
    pub title: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterInfo {
    pub title: String,
    pub url: String,
    pub chapter_number: Option<f64>,
    pub uploaded_at_ts: Option<i64>,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    /// 注册表使用的 key，例如 `mangahere:en`。
    fn id(&self) -> &str;

    fn base_urls(&self) -> &[String] {
        &[]
    }

    fn user_agent(&self) -> Option<&str> {
        None
    }

    /// 抓图默认使用的 Referer，缺省为第一个 base url。
    fn referer(&self) -> Option<&str> {
        self.base_urls().first().map(|s| s.as_str())
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<ContentCard>>;

    async fn chapters(&self, content_url: &str) -> Result<Vec<ChapterInfo>>;

    /// 章节内按顺序排列的页面引用。
    async fn pages(&self, chapter_url: &str) -> Result<Vec<String>>;

    /// 把页面引用解析为可直接 GET 的图片地址；多数来源页面引用本身就是图片地址。
    async fn resolve_image(&self, page_ref: &str) -> Result<String> {
        Ok(page_ref.to_string())
    }
}

#[derive(Default, Clone)]
pub struct ScraperRegistry {
    scrapers: HashMap<String, Arc<dyn Scraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scraper: Arc<dyn Scraper>) {
        let key = normalize_key(scraper.id());
        if self.scrapers.insert(key.clone(), scraper).is_some() {
            tracing::warn!(target: "startup", source = %key, "scraper registered twice, keeping the latest");
        }
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Scraper>> {
        self.scrapers.get(&normalize_key(source)).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.scrapers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

pub fn normalize_key(source: &str) -> String {
    source.trim().to_lowercase()
}

/// 内置来源。
pub fn default_registry() -> ScraperRegistry {
    let mut registry = ScraperRegistry::new();
    registry.register(Arc::new(manifest::ManifestScraper::new()));
    registry
}
