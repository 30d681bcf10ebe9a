use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};

use crate::base_system::context::Config;
use crate::download::catalog::JsonCatalog;
use crate::download::fetcher::{AssetFetcher, FetchPolicy};
use crate::download::manager::{DownloadManager, ManagerDeps};
use crate::download::store::{FileJobStore, JobStore};
use crate::image_cache::DiskImageCache;
use crate::source::ScraperRegistry;

/// 所有路由共享的服务句柄。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bind: SocketAddr,
    pub(crate) data_dir: Arc<PathBuf>,
    pub(crate) config: Arc<Mutex<Config>>, // allow runtime updates via /api/settings
    pub(crate) scrapers: Arc<ScraperRegistry>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) catalog: Arc<JsonCatalog>,
    pub(crate) cache: Arc<DiskImageCache>,
    pub(crate) fetcher: Arc<AssetFetcher>,
    pub(crate) manager: Arc<DownloadManager>,
}

impl AppState {
    /// 按配置打开存储、目录、缓存并创建下载管理器（尚未启动）。
    pub(crate) fn open(config: Config, bind: SocketAddr, scrapers: ScraperRegistry) -> Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir failed: {}", data_dir.display()))?;

        let scrapers = Arc::new(scrapers);
        let fetcher = Arc::new(
            AssetFetcher::new(FetchPolicy::from_config(&config), scrapers.clone())
                .context("build http client failed")?,
        );
        let store: Arc<dyn JobStore> =
            Arc::new(FileJobStore::open_in(&data_dir).context("open job store failed")?);
        let catalog = Arc::new(JsonCatalog::open_in(&data_dir).context("open library failed")?);
        let cache_dir = config.image_cache_dir();
        let cache = Arc::new(
            DiskImageCache::open(&cache_dir)
                .with_context(|| format!("open image cache failed: {}", cache_dir.display()))?,
        );

        let config = Arc::new(Mutex::new(config));
        let manager = Arc::new(DownloadManager::new(ManagerDeps {
            store: store.clone(),
            catalog: catalog.clone(),
            scrapers: scrapers.clone(),
            fetcher: fetcher.clone(),
            config: config.clone(),
        }));

        Ok(Self {
            bind,
            data_dir: Arc::new(data_dir),
            config,
            scrapers,
            store,
            catalog,
            cache,
            fetcher,
            manager,
        })
    }

    pub(crate) fn config(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config_snapshot(&self) -> Config {
        self.config().clone()
    }
}
