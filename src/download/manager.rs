//! 下载管理器：任务队列、并发执行、暂停/恢复/取消。
//!
//! - 单一分发循环从队列取出 job id，为每个任务启动独立的 tokio task
//! - 同时运行的任务数受 `max_concurrent_downloads` 限制（启动时读取）
//! - 暂停意图持久化为任务状态 `paused`；取消通过每个任务的 CancellationToken 通知
//! - 每页写盘后立即写检查点，进程崩溃后 `downloaded_pages` 即为已落盘页数

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::catalog::ChapterCatalog;
use super::fetcher::{AssetFetcher, FetchError};
use super::models::{DownloadJob, JobId, JobStatus};
use super::paths::{detect_extension, page_file_name, resolve_chapter_dir};
use super::store::{JobStore, StoreError};
use crate::base_system::context::Config;
use crate::source::ScraperRegistry;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("download job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 单个任务执行过程中的错误，最终写入任务记录的 `error` 字段。
#[derive(Debug, Error)]
pub(crate) enum DownloadError {
    #[error("Missing chapter_url or source")]
    MissingFields,
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("No pages returned by source")]
    NoPages,
    #[error("Too many pages: {0}")]
    TooManyPages(usize),
    #[error("Scraper error: {0:#}")]
    Scraper(anyhow::Error),
    #[error("Page {index}: {source}")]
    Fetch { index: usize, source: FetchError },
    #[error("Write {path} failed: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
enum JobOutcome {
    Completed(PathBuf),
    Paused,
    Cancelled,
    /// 任务已是终态或已被删除，无副作用
    Skipped,
    /// 进程关闭：保持 `downloading`，下次启动由 `recover` 接手
    Interrupted,
}

pub struct ManagerDeps {
    pub store: Arc<dyn JobStore>,
    pub catalog: Arc<dyn ChapterCatalog>,
    pub scrapers: Arc<ScraperRegistry>,
    pub fetcher: Arc<AssetFetcher>,
    pub config: Arc<Mutex<Config>>,
}

#[derive(Debug)]
struct ActiveJob {
    cancel: CancellationToken,
    /// 运行期间再次入队：结束后重新放回队列
    rerun: bool,
}

struct Shared {
    store: Arc<dyn JobStore>,
    catalog: Arc<dyn ChapterCatalog>,
    scrapers: Arc<ScraperRegistry>,
    fetcher: Arc<AssetFetcher>,
    config: Arc<Mutex<Config>>,
    queue_tx: mpsc::UnboundedSender<JobId>,
    active: Mutex<HashMap<JobId, ActiveJob>>,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct DownloadManager {
    shared: Arc<Shared>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DownloadManager {
    pub fn new(deps: ManagerDeps) -> Self {
        let max_concurrent = lock(&deps.config).max_concurrent();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            store: deps.store,
            catalog: deps.catalog,
            scrapers: deps.scrapers,
            fetcher: deps.fetcher,
            config: deps.config,
            queue_tx,
            active: Mutex::new(HashMap::new()),
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        Self {
            shared,
            queue_rx: Mutex::new(Some(queue_rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// 启动分发循环；重复调用无效果。
    pub fn start(&self) {
        let Some(rx) = lock(&self.queue_rx).take() else {
            return;
        };
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.dispatch_loop(rx).await });
        *lock(&self.dispatcher) = Some(handle);
        info!(target: "download", max_concurrent = self.shared.limiter.available_permits(), "download manager started");
    }

    /// 停止分发并中断运行中的任务（不标记为取消，下次启动由 `recover` 接手）。
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!(target: "download", "download manager stopped");
    }

    /// 追加到待处理队列。调用方负责不重复入队非终态任务。
    pub fn enqueue(&self, id: JobId) {
        self.shared.enqueue(id);
    }

    pub fn pause(&self, id: JobId) -> Result<DownloadJob, ManagerError> {
        let job = self
            .shared
            .store
            .update(id, &mut |job| {
                if matches!(job.status, JobStatus::Pending | JobStatus::Downloading) {
                    job.set_status(JobStatus::Paused);
                }
            })?
            .ok_or(ManagerError::NotFound(id))?;
        info!(target: "download", job_id = id, status = %job.status, "pause requested");
        Ok(job)
    }

    pub fn resume(&self, id: JobId) -> Result<DownloadJob, ManagerError> {
        let mut requeue = false;
        let job = self
            .shared
            .store
            .update(id, &mut |job| {
                // 只有暂停或失败的任务可以恢复；运行中/排队中的任务保持原状态
                requeue = matches!(job.status, JobStatus::Paused | JobStatus::Failed);
                if requeue {
                    job.set_status(JobStatus::Pending);
                }
            })?
            .ok_or(ManagerError::NotFound(id))?;
        if requeue {
            info!(target: "download", job_id = id, "resume requested");
            self.shared.enqueue(id);
        } else {
            debug!(target: "download", job_id = id, status = %job.status, "resume ignored");
        }
        Ok(job)
    }

    pub fn cancel(&self, id: JobId) -> Result<DownloadJob, ManagerError> {
        let job = self
            .shared
            .store
            .update(id, &mut |job| {
                if job.status != JobStatus::Completed {
                    job.set_status(JobStatus::Cancelled);
                }
            })?
            .ok_or(ManagerError::NotFound(id))?;

        if let Some(active) = lock(&self.shared.active).get_mut(&id) {
            active.rerun = false;
            active.cancel.cancel();
        }
        info!(target: "download", job_id = id, status = %job.status, "cancel requested");
        Ok(job)
    }

    /// 启动时恢复：`downloading`（上次进程中断）回到 `pending`，与 `pending` 一起重新入队。
    /// `paused` 保持暂停。
    pub fn recover(&self) -> Result<usize, ManagerError> {
        let mut jobs = self.shared.store.list()?;
        jobs.reverse(); // oldest first
        let mut count = 0;
        for job in jobs {
            match job.status {
                JobStatus::Downloading => {
                    self.shared
                        .store
                        .update(job.id, &mut |j| j.set_status(JobStatus::Pending))?;
                    info!(
                        target: "download",
                        job_id = job.id,
                        downloaded = job.downloaded_pages,
                        total = job.total_pages,
                        "recovering interrupted download"
                    );
                }
                JobStatus::Pending => {}
                _ => continue,
            }
            self.shared.enqueue(job.id);
            count += 1;
        }
        Ok(count)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.shared.active).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_active(&self, id: JobId) -> bool {
        lock(&self.shared.active).contains_key(&id)
    }
}

/// 运行结束（含 panic）时从 active 表移除，并处理期间的重复入队。
struct ActiveGuard {
    shared: Arc<Shared>,
    id: JobId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let rerun = lock(&self.shared.active)
            .remove(&self.id)
            .map(|a| a.rerun)
            .unwrap_or(false);
        if rerun && !self.shared.shutdown.is_cancelled() {
            debug!(target: "download", job_id = self.id, "re-dispatching job enqueued while running");
            self.shared.enqueue(self.id);
        }
    }
}

async fn or_cancel<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

impl Shared {
    fn enqueue(&self, id: JobId) {
        if self.queue_tx.send(id).is_err() {
            warn!(target: "download", job_id = id, "queue closed, job not enqueued");
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<JobId>) {
        loop {
            let id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            match self.store_get(id).await {
                Ok(Some(job)) if job.status == JobStatus::Paused => {
                    debug!(target: "download", job_id = id, "job paused, not dispatching");
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(target: "download", job_id = id, "queued job no longer exists");
                    continue;
                }
                Err(e) => {
                    warn!(target: "download", job_id = id, error = %e, "failed to load queued job");
                    continue;
                }
            }

            if let Some(active) = lock(&self.active).get_mut(&id) {
                active.rerun = true;
                continue;
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let cancel = self.shutdown.child_token();
            lock(&self.active).insert(
                id,
                ActiveJob {
                    cancel: cancel.clone(),
                    rerun: false,
                },
            );

            let guard = ActiveGuard {
                shared: self.clone(),
                id,
            };
            self.tracker.spawn(async move {
                let _permit = permit;
                let shared = guard.shared.clone();
                shared.run_job(id, cancel).await;
                drop(guard);
            });
        }
        debug!(target: "download", "dispatch loop exited");
    }

    async fn run_job(&self, id: JobId, cancel: CancellationToken) {
        match self.execute(id, &cancel).await {
            Ok(JobOutcome::Completed(dir)) => {
                info!(target: "download", job_id = id, dir = %dir.display(), "chapter download completed");
            }
            Ok(JobOutcome::Paused) => info!(target: "download", job_id = id, "download paused"),
            Ok(JobOutcome::Cancelled) => info!(target: "download", job_id = id, "download cancelled"),
            Ok(JobOutcome::Interrupted) => {
                info!(target: "download", job_id = id, "download interrupted by shutdown")
            }
            Ok(JobOutcome::Skipped) => debug!(target: "download", job_id = id, "nothing to do"),
            Err(err) => {
                let message = err.to_string();
                warn!(target: "download", job_id = id, error = %message, "chapter download failed");
                let result = self
                    .store_update(id, move |job| {
                        if job.status != JobStatus::Cancelled {
                            job.fail(message.clone());
                        }
                    })
                    .await;
                if let Err(e) = result {
                    warn!(target: "download", job_id = id, error = %e, "failed to record job failure");
                }
            }
        }
    }

    /// 任务表每次修改都会整表落盘并 fsync，放到阻塞线程池执行。
    async fn store_update<F>(&self, id: JobId, mut apply: F) -> Result<Option<DownloadJob>, StoreError>
    where
        F: FnMut(&mut DownloadJob) + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.update(id, &mut apply)).await?
    }

    async fn store_get(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get(id)).await?
    }

    fn stopped(&self) -> JobOutcome {
        if self.shutdown.is_cancelled() {
            JobOutcome::Interrupted
        } else {
            JobOutcome::Cancelled
        }
    }

    fn download_root(&self) -> PathBuf {
        lock(&self.config).default_save_dir()
    }

    async fn execute(
        &self,
        id: JobId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, DownloadError> {
        let Some(job) = self.store_get(id).await? else {
            return Ok(JobOutcome::Skipped);
        };
        if job.status.is_terminal() {
            return Ok(JobOutcome::Skipped);
        }
        if job.status == JobStatus::Paused {
            return Ok(JobOutcome::Paused);
        }

        let chapter_url = job.chapter_url.as_deref().map(str::trim).unwrap_or("");
        let source = job.source.as_deref().map(str::trim).unwrap_or("");
        if chapter_url.is_empty() || source.is_empty() {
            return Err(DownloadError::MissingFields);
        }

        let Some(job) = self
            .store_update(id, |j| {
                if matches!(
                    j.status,
                    JobStatus::Pending | JobStatus::Downloading | JobStatus::Failed
                ) {
                    j.begin_attempt();
                }
            })
            .await?
        else {
            return Ok(JobOutcome::Skipped);
        };
        if job.status != JobStatus::Downloading {
            return Ok(match job.status {
                JobStatus::Paused => JobOutcome::Paused,
                JobStatus::Cancelled => JobOutcome::Cancelled,
                _ => JobOutcome::Skipped,
            });
        }

        let scraper = self
            .scrapers
            .get(source)
            .ok_or_else(|| DownloadError::UnknownSource(source.to_string()))?;

        let Some(pages) = or_cancel(cancel, scraper.pages(chapter_url)).await else {
            return Ok(self.stopped());
        };
        let pages = pages.map_err(DownloadError::Scraper)?;
        if pages.is_empty() {
            return Err(DownloadError::NoPages);
        }
        let total = u32::try_from(pages.len()).map_err(|_| DownloadError::TooManyPages(pages.len()))?;
        self.store_update(id, move |j| j.set_total_pages(total))
            .await?;

        // 同一任务再次执行（恢复/重试）沿用上次目录，不触发冲突后缀
        let chapter_dir = match job.file_path.clone() {
            Some(prev) => prev,
            None => resolve_chapter_dir(
                &self.download_root(),
                &job.content_title,
                job.chapter_number,
                job.chapter_title.as_deref(),
                id,
            ),
        };
        tokio::fs::create_dir_all(&chapter_dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: chapter_dir.clone(),
                source,
            })?;
        debug!(target: "download", job_id = id, total, dir = %chapter_dir.display(), "downloading chapter");

        for (offset, page_ref) in pages.iter().enumerate() {
            let index = offset + 1;

            if cancel.is_cancelled() {
                return Ok(self.stopped());
            }
            match self.store_get(id).await?.map(|j| j.status) {
                None => return Ok(JobOutcome::Skipped),
                Some(JobStatus::Cancelled) => return Ok(JobOutcome::Cancelled),
                Some(JobStatus::Paused) => return Ok(JobOutcome::Paused),
                Some(_) => {}
            }

            let Some(resolved) = or_cancel(cancel, scraper.resolve_image(page_ref)).await else {
                return Ok(self.stopped());
            };
            let resolved = resolved.map_err(DownloadError::Scraper)?;

            let Some(asset) = or_cancel(cancel, self.fetcher.fetch(&resolved, Some(source))).await
            else {
                return Ok(self.stopped());
            };
            let asset = asset.map_err(|source| DownloadError::Fetch { index, source })?;

            let ext = detect_extension(&resolved, asset.content_type.as_deref());
            let out_file = chapter_dir.join(page_file_name(index, ext));
            write_page(&out_file, &asset.bytes).await?;

            let downloaded = index as u32;
            let dir = chapter_dir.clone();
            self.store_update(id, move |j| j.checkpoint(downloaded, &dir))
                .await?;
            debug!(target: "download", job_id = id, page = index, total, "page saved");
        }

        let dir = chapter_dir.clone();
        let done = self
            .store_update(id, move |j| {
                if j.status == JobStatus::Cancelled {
                    return;
                }
                j.checkpoint(total, &dir);
                j.progress = 1.0;
                j.error = None;
                j.set_status(JobStatus::Completed);
            })
            .await?;
        match done.map(|j| j.status) {
            None => return Ok(JobOutcome::Skipped),
            Some(JobStatus::Completed) => {}
            Some(_) => return Ok(JobOutcome::Cancelled),
        }

        if let Err(e) = self
            .catalog
            .mark_offline(job.content_id, job.chapter_number, &chapter_dir)
        {
            warn!(target: "download", job_id = id, error = %e, "failed to mark chapter offline");
        }
        Ok(JobOutcome::Completed(chapter_dir))
    }
}

async fn write_page(path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::{StatusCode, header};
    use axum::response::IntoResponse;
    use axum::routing::get;

    use crate::download::catalog::JsonCatalog;
    use crate::download::fetcher::FetchPolicy;
    use crate::download::models::NewJob;
    use crate::download::store::FileJobStore;
    use crate::source::{ChapterInfo, ContentCard, Scraper};

    /// Pages whose number is listed in `gated` wait for a permit before responding.
    #[derive(Clone)]
    struct PageServer {
        gate: Arc<Semaphore>,
        gated: Arc<Vec<usize>>,
    }

    async fn page_handler(
        State(server): State<PageServer>,
        AxumPath(name): AxumPath<String>,
    ) -> axum::response::Response {
        let number: usize = name
            .split('.')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if number == 404 {
            return StatusCode::NOT_FOUND.into_response();
        }
        if server.gated.contains(&number) {
            let _ = server.gate.acquire().await.map(|p| p.forget());
        }
        (
            [(header::CONTENT_TYPE, "image/png")],
            format!("page-{number}").into_bytes(),
        )
            .into_response()
    }

    async fn serve(gated: Vec<usize>) -> (String, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let router = Router::new()
            .route("/p/:name", get(page_handler))
            .with_state(PageServer {
                gate: gate.clone(),
                gated: Arc::new(gated),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        (format!("http://{addr}"), gate)
    }

    /// `chapter_url` is `"<n>"` (n pages) or `"<n>:<bad page>"`.
    struct FakeSource {
        base: String,
    }

    #[async_trait]
    impl Scraper for FakeSource {
        fn id(&self) -> &str {
            "fake"
        }

        async fn search(&self, _q: &str, _p: u32) -> anyhow::Result<Vec<ContentCard>> {
            Ok(Vec::new())
        }

        async fn chapters(&self, _u: &str) -> anyhow::Result<Vec<ChapterInfo>> {
            Ok(Vec::new())
        }

        async fn pages(&self, chapter_url: &str) -> anyhow::Result<Vec<String>> {
            let (count, bad) = match chapter_url.split_once(':') {
                Some((c, b)) => (c.parse::<usize>()?, b.parse::<usize>().ok()),
                None => (chapter_url.parse::<usize>()?, None),
            };
            Ok((1..=count)
                .map(|n| {
                    let n = if Some(n) == bad { 404 } else { n };
                    format!("p/{n}")
                })
                .collect())
        }

        async fn resolve_image(&self, page_ref: &str) -> anyhow::Result<String> {
            Ok(format!("{}/{}", self.base, page_ref))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: Arc<FileJobStore>,
        catalog: Arc<JsonCatalog>,
        manager: DownloadManager,
    }

    fn harness(base: &str, max_concurrent: usize) -> Harness {
        harness_with(base, max_concurrent, |store| store)
    }

    /// `wrap` decides which store the manager talks to; the harness keeps the inner one.
    fn harness_with(
        base: &str,
        max_concurrent: usize,
        wrap: impl FnOnce(Arc<FileJobStore>) -> Arc<dyn JobStore>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("downloads");
        let mut config = Config::default().with_data_dir(dir.path());
        config.save_path = root.to_string_lossy().to_string();
        config.max_concurrent_downloads = max_concurrent;

        let mut registry = ScraperRegistry::new();
        registry.register(Arc::new(FakeSource {
            base: base.to_string(),
        }));
        let scrapers = Arc::new(registry);
        let policy = FetchPolicy {
            timeout: Duration::from_secs(5),
            connect_timeout: None,
            max_retries: 0,
            backoff: Duration::from_millis(1),
            user_agent: "test".to_string(),
        };
        let fetcher = Arc::new(AssetFetcher::new(policy, scrapers.clone()).unwrap());
        let store = Arc::new(FileJobStore::open_in(dir.path()).unwrap());
        let catalog = Arc::new(JsonCatalog::open_in(dir.path()).unwrap());

        let manager = DownloadManager::new(ManagerDeps {
            store: wrap(store.clone()),
            catalog: catalog.clone(),
            scrapers,
            fetcher,
            config: Arc::new(Mutex::new(config)),
        });
        Harness {
            _dir: dir,
            root,
            store,
            catalog,
            manager,
        }
    }

    impl Harness {
        fn add_job(&self, chapter_url: Option<&str>, source: Option<&str>) -> DownloadJob {
            let content_id = self
                .catalog
                .register_content("https://example.com/series/1", "My Manga: Test?", "fake")
                .unwrap();
            self.store
                .insert(NewJob {
                    content_id,
                    content_title: "My Manga: Test?".to_string(),
                    chapter_number: 1.0,
                    chapter_title: Some("I am SHY".to_string()),
                    chapter_url: chapter_url.map(str::to_string),
                    source: source.map(str::to_string),
                })
                .unwrap()
        }

        async fn wait_for(&self, id: JobId, pred: impl Fn(&DownloadJob) -> bool) -> DownloadJob {
            for _ in 0..500 {
                let job = self.store.get(id).unwrap().unwrap();
                if pred(&job) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting on job {id}: {:?}", self.store.get(id).unwrap());
        }

        async fn wait_idle(&self) {
            for _ in 0..500 {
                if self.manager.active_jobs().is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("manager never went idle");
        }

        fn chapter_dir(&self) -> PathBuf {
            self.root.join("my-manga-test").join("Chapter_001__i-am-shy")
        }
    }

    fn page_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn downloads_all_pages_in_order_and_marks_offline() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 2);
        let job = h.add_job(Some("3"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        let done = h.wait_for(job.id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(done.total_pages, 3);
        assert_eq!(done.downloaded_pages, 3);
        assert!((done.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(done.file_path.as_deref(), Some(h.chapter_dir().as_path()));
        assert!(done.error.is_none());

        let dir = h.chapter_dir();
        assert_eq!(page_files(&dir), vec!["001.png", "002.png", "003.png"]);
        assert_eq!(std::fs::read(dir.join("002.png")).unwrap(), b"page-2");
        assert_eq!(
            h.catalog.offline_path(done.content_id, 1.0).unwrap(),
            Some(dir)
        );
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn pause_then_resume_completes_all_pages() {
        let (base, gate) = serve(vec![3]).await;
        let h = harness(&base, 2);
        let job = h.add_job(Some("5"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        h.wait_for(job.id, |j| j.downloaded_pages == 2).await;
        let paused = h.manager.pause(job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        // let the in-flight page finish; the worker stops at the next boundary
        gate.add_permits(100);
        h.wait_idle().await;
        let stopped = h.store.get(job.id).unwrap().unwrap();
        assert_eq!(stopped.status, JobStatus::Paused);
        assert!(stopped.downloaded_pages < 5);

        let resumed = h.manager.resume(job.id).unwrap();
        assert_eq!(resumed.status, JobStatus::Pending);
        let done = h.wait_for(job.id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(done.downloaded_pages, 5);
        assert_eq!(done.file_path.as_deref(), Some(h.chapter_dir().as_path()));

        let dir = h.chapter_dir();
        let files = page_files(&dir);
        assert_eq!(files, vec!["001.png", "002.png", "003.png", "004.png", "005.png"]);
        for (i, name) in files.iter().enumerate() {
            let body = std::fs::read(dir.join(name)).unwrap();
            assert_eq!(body, format!("page-{}", i + 1).into_bytes());
        }
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn resume_leaves_running_job_untouched() {
        let (base, gate) = serve(vec![2]).await;
        let h = harness(&base, 1);
        let job = h.add_job(Some("4"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        h.wait_for(job.id, |j| j.downloaded_pages == 1).await;
        let after = h.manager.resume(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Downloading);
        assert_eq!(
            h.store.get(job.id).unwrap().unwrap().status,
            JobStatus::Downloading
        );
        assert!(h.manager.is_active(job.id));

        gate.add_permits(100);
        let done = h.wait_for(job.id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(done.downloaded_pages, 4);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn resume_retries_failed_job_and_ignores_pending() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        let failed = h.add_job(Some("2"), Some("fake"));
        h.store
            .update(failed.id, &mut |j| j.fail("Page 1: http 503"))
            .unwrap();
        let queued = h.add_job(Some("2"), Some("fake"));

        // manager not started yet: the pending job stays as it is
        let same = h.manager.resume(queued.id).unwrap();
        assert_eq!(same.status, JobStatus::Pending);
        assert_eq!(same.updated_at, queued.updated_at);

        let retried = h.manager.resume(failed.id).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        h.manager.start();
        let done = h.wait_for(failed.id, |j| j.status == JobStatus::Completed).await;
        assert!(done.error.is_none());
        h.manager.shutdown().await;
    }

    /// Simulates a slow disk: every mutation blocks the calling thread.
    struct SlowStore {
        inner: Arc<FileJobStore>,
        delay: Duration,
    }

    impl JobStore for SlowStore {
        fn insert(&self, new: NewJob) -> Result<DownloadJob, StoreError> {
            self.inner.insert(new)
        }

        fn get(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError> {
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<DownloadJob>, StoreError> {
            self.inner.list()
        }

        fn update(
            &self,
            id: JobId,
            apply: &mut dyn FnMut(&mut DownloadJob),
        ) -> Result<Option<DownloadJob>, StoreError> {
            std::thread::sleep(self.delay);
            self.inner.update(id, apply)
        }

        fn remove(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError> {
            self.inner.remove(id)
        }
    }

    #[tokio::test]
    async fn slow_checkpoints_do_not_stall_the_runtime() {
        let (base, _gate) = serve(vec![]).await;
        let delay = Duration::from_millis(150);
        let h = harness_with(&base, 1, |inner| Arc::new(SlowStore { inner, delay }));
        let job = h.add_job(Some("3"), Some("fake"));

        // single-threaded test runtime: a blocked checkpoint would freeze this ticker
        let finished = Arc::new(AtomicBool::new(false));
        let ticker = tokio::spawn({
            let finished = finished.clone();
            async move {
                let mut worst = Duration::ZERO;
                let mut last = Instant::now();
                while !finished.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let now = Instant::now();
                    worst = worst.max(now - last);
                    last = now;
                }
                worst
            }
        });

        h.manager.start();
        h.manager.enqueue(job.id);
        h.wait_for(job.id, |j| j.status == JobStatus::Completed).await;
        finished.store(true, Ordering::SeqCst);
        let worst = ticker.await.unwrap();
        assert!(worst < delay, "runtime stalled for {worst:?}");
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_stops_further_page_writes() {
        let (base, gate) = serve(vec![3]).await;
        let h = harness(&base, 2);
        let job = h.add_job(Some("5"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        h.wait_for(job.id, |j| j.downloaded_pages == 2).await;
        let cancelled = h.manager.cancel(job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        h.wait_idle().await;

        gate.add_permits(100);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = h.store.get(job.id).unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(after.downloaded_pages, 2);
        assert_eq!(page_files(&h.chapter_dir()), vec!["001.png", "002.png"]);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn missing_fields_fail_permanently() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        let job = h.add_job(None, Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        let failed = h.wait_for(job.id, |j| j.status == JobStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("Missing chapter_url or source"));
        assert!(!h.root.exists() || page_files(&h.chapter_dir()).is_empty());
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn empty_page_list_and_unknown_source_fail() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        let empty = h.add_job(Some("0"), Some("fake"));
        let unknown = h.add_job(Some("2"), Some("nowhere"));
        h.manager.start();
        h.manager.enqueue(empty.id);
        h.manager.enqueue(unknown.id);

        let a = h.wait_for(empty.id, |j| j.status == JobStatus::Failed).await;
        assert_eq!(a.error.as_deref(), Some("No pages returned by source"));
        let b = h.wait_for(unknown.id, |j| j.status == JobStatus::Failed).await;
        assert_eq!(b.error.as_deref(), Some("Unknown source: nowhere"));
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn fetch_failure_keeps_earlier_pages_and_records_error() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        let job = h.add_job(Some("4:3"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);

        let failed = h.wait_for(job.id, |j| j.status == JobStatus::Failed).await;
        assert_eq!(failed.downloaded_pages, 2);
        assert!(failed.error.as_deref().unwrap().contains("404"));
        assert_eq!(page_files(&h.chapter_dir()), vec!["001.png", "002.png"]);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_jobs_are_skipped() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        let job = h.add_job(Some("2"), Some("fake"));
        h.manager.cancel(job.id).unwrap();
        h.manager.start();
        h.manager.enqueue(job.id);
        h.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = h.store.get(job.id).unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Cancelled);
        assert_eq!(after.total_pages, 0);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn control_calls_on_unknown_jobs_error() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 1);
        assert!(matches!(h.manager.pause(77), Err(ManagerError::NotFound(77))));
        assert!(matches!(h.manager.resume(77), Err(ManagerError::NotFound(77))));
        assert!(matches!(h.manager.cancel(77), Err(ManagerError::NotFound(77))));
    }

    #[tokio::test]
    async fn concurrency_bound_limits_running_jobs() {
        let (base, gate) = serve(vec![1]).await;
        let h = harness(&base, 1);
        let a = h.add_job(Some("1"), Some("fake"));
        let b = h.add_job(Some("1"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(a.id);
        h.manager.enqueue(b.id);

        h.wait_for(a.id, |j| j.status == JobStatus::Downloading).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.manager.active_jobs(), vec![a.id]);
        assert_eq!(h.store.get(b.id).unwrap().unwrap().status, JobStatus::Pending);

        gate.add_permits(100);
        h.wait_for(a.id, |j| j.status == JobStatus::Completed).await;
        let done_b = h.wait_for(b.id, |j| j.status == JobStatus::Completed).await;
        // second job for the same chapter lands in a suffixed directory
        assert!(
            done_b
                .file_path
                .unwrap()
                .ends_with(format!("Chapter_001__i-am-shy__{}", b.id))
        );
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn recover_requeues_interrupted_downloads() {
        let (base, _gate) = serve(vec![]).await;
        let h = harness(&base, 2);
        let interrupted = h.add_job(Some("2"), Some("fake"));
        let paused = h.add_job(Some("2"), Some("fake"));
        h.store
            .update(interrupted.id, &mut |j| j.set_status(JobStatus::Downloading))
            .unwrap();
        h.store
            .update(paused.id, &mut |j| j.set_status(JobStatus::Paused))
            .unwrap();

        assert_eq!(h.manager.recover().unwrap(), 1);
        h.manager.start();
        h.wait_for(interrupted.id, |j| j.status == JobStatus::Completed)
            .await;
        h.wait_idle().await;
        assert_eq!(
            h.store.get(paused.id).unwrap().unwrap().status,
            JobStatus::Paused
        );
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_running_job_recoverable() {
        let (base, _gate) = serve(vec![2]).await;
        let h = harness(&base, 1);
        let job = h.add_job(Some("3"), Some("fake"));
        h.manager.start();
        h.manager.enqueue(job.id);
        h.wait_for(job.id, |j| j.downloaded_pages == 1).await;

        h.manager.shutdown().await;
        let after = h.store.get(job.id).unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Downloading);
        assert_eq!(after.downloaded_pages, 1);
    }
}
