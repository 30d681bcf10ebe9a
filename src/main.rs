//! 漫画章节离线下载服务。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/文件工具等基础设施
//! - `download`：任务模型、任务存储、路径解析、图片抓取与下载调度
//! - `image_cache`：图片磁盘缓存（TTL + LRU）
//! - `source`：来源（scraper）接口与内置来源
//! - `web`：HTTP 接口

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;

mod base_system;
mod download;
mod image_cache;
mod source;
mod web;

use base_system::config::load_or_create_with_base;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "manga-downloader")]
#[command(about = "Offline manga chapter downloader with an image cache")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（存放 config.yml、logs、任务表与默认下载目录，方便 Docker 挂载）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 覆盖监听地址，例如 127.0.0.1:8765
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("manga-downloader v{VERSION}");
        return Ok(());
    }

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None if cfg!(feature = "docker") => PathBuf::from("/data"),
        None => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&data_dir)?;

    let log = init_logging(cli.debug, &data_dir)?;
    info!(target: "startup", version = VERSION, data_dir = %data_dir.display(), "starting");

    let config = load_or_create_with_base::<Config>(Some(&data_dir))
        .map_err(|e| anyhow!(e.to_string()))?
        .with_data_dir(&data_dir);

    let result = web::run(config, cli.bind.as_deref(), source::default_registry());
    if let Err(e) = &result {
        tracing::error!(target: "startup", error = %format!("{e:#}"), "server exited with error");
    }
    // 刷盘并归档 latest.log
    drop(log);
    result
}

fn init_logging(debug: bool, data_dir: &std::path::Path) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        ..LogOptions::default()
    };
    LogSystem::start(opts, data_dir).map_err(|e| anyhow!(e))
}
