//! 单个图片资源的抓取（Asset Fetcher）。
//!
//! - 请求头按来源设置 User-Agent / Referer
//! - 403：换成 URL 自身 origin 作为 Referer 重试一次
//! - 超时/连接失败：固定间隔重试，次数有上限
//! - 其它 4xx/5xx 不重试，错误里带上 HTTP 状态码

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER, USER_AGENT,
};
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::source::ScraperRegistry;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("http {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Network {
        url: String,
        attempts: u32,
        source: reqwest::Error,
    },
    #[error("http client build failed: {0}")]
    Client(reqwest::Error),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Network { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub connect_timeout: Option<Duration>,
    /// 瞬时错误的额外重试次数（不含首次请求）。
    pub max_retries: u32,
    pub backoff: Duration,
    pub user_agent: String,
}

impl FetchPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: cfg.request_timeout(),
            connect_timeout: cfg.connect_timeout(),
            max_retries: cfg.max_retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
            user_agent: cfg.user_agent.clone(),
        }
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

pub struct AssetFetcher {
    client: Client,
    policy: FetchPolicy,
    scrapers: Arc<ScraperRegistry>,
}

impl AssetFetcher {
    pub fn new(policy: FetchPolicy, scrapers: Arc<ScraperRegistry>) -> Result<Self, FetchError> {
        // reqwest 未启用 gzip 解码，请求 identity 编码以直接拿到原始字节。
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/avif,image/webp,image/*,*/*;q=0.8"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(policy.timeout);
        if let Some(connect) = policy.connect_timeout {
            builder = builder.connect_timeout(connect);
        }
        let client = builder.build().map_err(FetchError::Client)?;

        Ok(Self {
            client,
            policy,
            scrapers,
        })
    }

    fn source_headers(&self, source: Option<&str>) -> HeaderMap {
        let scraper = source.and_then(|s| self.scrapers.get(s));
        let user_agent = scraper
            .as_ref()
            .and_then(|s| s.user_agent().map(str::to_string))
            .unwrap_or_else(|| self.policy.user_agent.clone());
        let referer = scraper.as_ref().and_then(|s| s.referer().map(str::to_string));

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent).unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        if let Some(referer) = referer
            && let Ok(v) = HeaderValue::from_str(&referer)
        {
            headers.insert(REFERER, v);
        }
        headers
    }

    pub async fn fetch(&self, url: &str, source: Option<&str>) -> Result<FetchedAsset, FetchError> {
        let parsed = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let mut headers = self.source_headers(source);
        let mut tried_origin_referer = false;
        let mut transient_failures = 0u32;

        loop {
            let attempt = transient_failures + 1;
            let result = self
                .client
                .get(parsed.clone())
                .headers(headers.clone())
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) if is_transient(&e) && transient_failures < self.policy.max_retries => {
                    transient_failures += 1;
                    warn!(target: "fetch", url = %parsed, attempt, error = %e, "transient error, retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                    continue;
                }
                Err(e) => {
                    return Err(FetchError::Network {
                        url: parsed.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            };

            let status = resp.status();
            if status == StatusCode::FORBIDDEN && !tried_origin_referer {
                tried_origin_referer = true;
                if let Some(origin) = origin_referer(&parsed)
                    && let Ok(v) = HeaderValue::from_str(&origin)
                {
                    debug!(target: "fetch", url = %parsed, referer = %origin, "403, retrying with origin referer");
                    headers.insert(REFERER, v);
                    continue;
                }
            }
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: parsed.to_string(),
                    status: status.as_u16(),
                });
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match resp.bytes().await {
                Ok(bytes) => {
                    return Ok(FetchedAsset {
                        bytes: bytes.to_vec(),
                        content_type,
                    });
                }
                Err(e) if is_transient(&e) && transient_failures < self.policy.max_retries => {
                    transient_failures += 1;
                    warn!(target: "fetch", url = %parsed, attempt, error = %e, "body read failed, retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(e) => {
                    return Err(FetchError::Network {
                        url: parsed.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body()
}

/// `scheme://host[:port]/`
fn origin_referer(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
        None => format!("{}://{}/", url.scheme(), host),
    })
}
