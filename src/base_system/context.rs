//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 服务配置
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // 下载配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_min_connect_timeout")]
    pub min_connect_timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 图片缓存配置
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default)]
    pub cache_dir: String,

    #[serde(skip)]
    data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            save_path: String::new(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            request_timeout: default_request_timeout(),
            min_connect_timeout: default_min_connect_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            user_agent: default_user_agent(),
            cache_enabled: default_true(),
            cache_max_bytes: default_cache_max_bytes(),
            cache_ttl_hours: default_cache_ttl_hours(),
            cache_dir: String::new(),
            data_dir: None,
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 12] = [
            FieldMeta {
                name: "bind_addr",
                description: "HTTP 服务监听地址，例如 127.0.0.1:8765",
            },
            FieldMeta {
                name: "save_path",
                description: "章节下载保存路径（留空表示 <数据目录>/downloads）",
            },
            FieldMeta {
                name: "max_concurrent_downloads",
                description: "同时进行的章节下载任务上限",
            },
            FieldMeta {
                name: "request_timeout",
                description: "单次请求超时时间（秒）",
            },
            FieldMeta {
                name: "min_connect_timeout",
                description: "连接超时时间（秒，0 表示不单独限制）",
            },
            FieldMeta {
                name: "max_retries",
                description: "网络瞬时错误（超时/连接失败）的最大重试次数",
            },
            FieldMeta {
                name: "retry_backoff_ms",
                description: "重试间隔, 单位ms",
            },
            FieldMeta {
                name: "user_agent",
                description: "默认 User-Agent（来源可自行覆盖）",
            },
            FieldMeta {
                name: "cache_enabled",
                description: "是否启用图片磁盘缓存",
            },
            FieldMeta {
                name: "cache_max_bytes",
                description: "图片缓存容量上限（字节），超出后按最近最少使用淘汰",
            },
            FieldMeta {
                name: "cache_ttl_hours",
                description: "图片缓存有效期（小时），0 表示禁用缓存",
            },
            FieldMeta {
                name: "cache_dir",
                description: "图片缓存目录（留空表示 <数据目录>/image-cache）",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn default_save_dir(&self) -> PathBuf {
        non_empty_path(&self.save_path).unwrap_or_else(|| self.data_dir().join("downloads"))
    }

    pub fn image_cache_dir(&self) -> PathBuf {
        non_empty_path(&self.cache_dir).unwrap_or_else(|| self.data_dir().join("image-cache"))
    }

    /// 缓存实际生效的 TTL：关闭缓存时视为 0（所有读取均 miss）。
    pub fn effective_cache_ttl_hours(&self) -> u64 {
        if self.cache_enabled {
            self.cache_ttl_hours
        } else {
            0
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.min_connect_timeout <= 0.0 {
            return None;
        }
        let ms = (self.min_connect_timeout * 1000.0).round() as u64;
        if ms == 0 {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Path::new(trimmed).to_path_buf())
    }
}

fn default_bind_addr() -> String {
    if cfg!(feature = "docker") {
        "0.0.0.0:8765".to_string()
    } else {
        "127.0.0.1:8765".to_string()
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_min_connect_timeout() -> f64 {
    10.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_cache_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_cache_ttl_hours() -> u64 {
    720
}
