//! 作品目录（content catalog）：登记作品，并记录哪些章节已可离线阅读。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::models::ContentId;
use super::store::StoreError;
use crate::base_system::file_utils::write_atomic;

pub trait ChapterCatalog: Send + Sync {
    /// 按 url 查找作品，不存在时新建。
    fn register_content(
        &self,
        url: &str,
        title: &str,
        source: &str,
    ) -> Result<ContentId, StoreError>;

    fn mark_offline(
        &self,
        content_id: ContentId,
        chapter_number: f64,
        path: &Path,
    ) -> Result<(), StoreError>;

    fn offline_path(
        &self,
        content_id: ContentId,
        chapter_number: f64,
    ) -> Result<Option<PathBuf>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    pub id: ContentId,
    pub title: String,
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub offline: Vec<OfflineChapter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineChapter {
    pub chapter_number: f64,
    pub path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub downloaded_at: OffsetDateTime,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogTable {
    next_id: ContentId,
    contents: BTreeMap<ContentId, ContentEntry>,
}

pub struct JsonCatalog {
    path: PathBuf,
    table: Mutex<CatalogTable>,
}

impl JsonCatalog {
    pub const FILE_NAME: &'static str = "library.json";

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = match fs::read(&path) {
            Ok(raw) if !raw.iter().all(|b| b.is_ascii_whitespace()) => serde_json::from_slice(&raw)
                .map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?,
            Ok(_) => CatalogTable::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogTable::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn open_in(data_dir: &Path) -> Result<Self, StoreError> {
        Self::open(data_dir.join(Self::FILE_NAME))
    }

    pub fn contents(&self) -> Result<Vec<ContentEntry>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.contents.values().cloned().collect())
    }

    fn persist(&self, table: &CatalogTable) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(table)?;
        write_atomic(&self.path, &bytes).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn same_chapter(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

impl ChapterCatalog for JsonCatalog {
    fn register_content(
        &self,
        url: &str,
        title: &str,
        source: &str,
    ) -> Result<ContentId, StoreError> {
        let url = url.trim();
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = table.contents.values().find(|c| c.url == url) {
            return Ok(existing.id);
        }
        let id = table.next_id + 1;
        table.next_id = id;
        table.contents.insert(
            id,
            ContentEntry {
                id,
                title: title.trim().to_string(),
                url: url.to_string(),
                source: source.trim().to_string(),
                offline: Vec::new(),
            },
        );
        self.persist(&table)?;
        Ok(id)
    }

    fn mark_offline(
        &self,
        content_id: ContentId,
        chapter_number: f64,
        path: &Path,
    ) -> Result<(), StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(entry) = table.contents.get_mut(&content_id) else {
            // 作品可能已被外部删除；离线标记无处可挂
            tracing::debug!(target: "download", content_id, "content not in catalog, skip offline mark");
            return Ok(());
        };
        let record = OfflineChapter {
            chapter_number,
            path: path.to_path_buf(),
            downloaded_at: OffsetDateTime::now_utc(),
        };
        match entry
            .offline
            .iter_mut()
            .find(|c| same_chapter(c.chapter_number, chapter_number))
        {
            Some(existing) => *existing = record,
            None => entry.offline.push(record),
        }
        self.persist(&table)
    }

    fn offline_path(
        &self,
        content_id: ContentId,
        chapter_number: f64,
    ) -> Result<Option<PathBuf>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.contents.get(&content_id).and_then(|c| {
            c.offline
                .iter()
                .find(|o| same_chapter(o.chapter_number, chapter_number))
                .map(|o| o.path.clone())
        }))
    }
}
