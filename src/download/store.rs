//! 任务记录存储（Job Record Store）。
//!
//! 下载管理器只依赖 [`JobStore`] 接口；每次修改都视为立即持久化的提交。
//! [`FileJobStore`] 将整张表以 JSON 原子写入 `jobs.json`。

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use super::models::{DownloadJob, JobId, NewJob};
use crate::base_system::file_utils::write_atomic;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("job store is corrupt at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("job store serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("job store lock poisoned")]
    Poisoned,
    #[error("job store task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

pub trait JobStore: Send + Sync {
    fn insert(&self, new: NewJob) -> Result<DownloadJob, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError>;

    /// 按创建时间倒序（最新在前）。
    fn list(&self) -> Result<Vec<DownloadJob>, StoreError>;

    /// 在存储内部完成读-改-写；返回修改后的记录，不存在时返回 `None`。
    fn update(
        &self,
        id: JobId,
        apply: &mut dyn FnMut(&mut DownloadJob),
    ) -> Result<Option<DownloadJob>, StoreError>;

    fn remove(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobTable {
    next_id: JobId,
    jobs: BTreeMap<JobId, DownloadJob>,
}

#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileJobStore {
    pub const FILE_NAME: &'static str = "jobs.json";

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = if path.exists() {
            let raw = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                JobTable::default()
            } else {
                serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            JobTable::default()
        };

        let mut table = table;
        let max_id = table.jobs.keys().next_back().copied().unwrap_or(0);
        if table.next_id < max_id {
            warn!(target: "download", next_id = table.next_id, max_id, "job table id counter behind, repairing");
            table.next_id = max_id;
        }

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn open_in(data_dir: &Path) -> Result<Self, StoreError> {
        Self::open(data_dir.join(Self::FILE_NAME))
    }

    fn persist(&self, table: &JobTable) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(table)?;
        write_atomic(&self.path, &bytes).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, new: NewJob) -> Result<DownloadJob, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let id = table.next_id + 1;
        let job = DownloadJob::from_new(id, new, OffsetDateTime::now_utc());
        table.next_id = id;
        table.jobs.insert(id, job.clone());
        if let Err(e) = self.persist(&table) {
            table.jobs.remove(&id);
            table.next_id = id - 1;
            return Err(e);
        }
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.jobs.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<DownloadJob>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let mut jobs: Vec<DownloadJob> = table.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(jobs)
    }

    fn update(
        &self,
        id: JobId,
        apply: &mut dyn FnMut(&mut DownloadJob),
    ) -> Result<Option<DownloadJob>, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(job) = table.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let before = job.clone();
        apply(job);
        let after = job.clone();
        if after == before {
            return Ok(Some(after));
        }
        if let Err(e) = self.persist(&table) {
            table.jobs.insert(id, before);
            return Err(e);
        }
        Ok(Some(after))
    }

    fn remove(&self, id: JobId) -> Result<Option<DownloadJob>, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(job) = table.jobs.remove(&id) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&table) {
            table.jobs.insert(id, job);
            return Err(e);
        }
        Ok(Some(job))
    }
}
