//! 图片磁盘缓存：TTL 过期 + 按容量的 LRU 淘汰。
//!
//! 每个条目两份文件：`<key>.bin`（内容）与 `<key>.json`（元数据）。
//! key 为 `sha256("<source 小写去空白>:<url 去空白>")`，因此缓存按来源隔离。
//! 同一实例上的所有读/写/淘汰都由一把互斥锁串行化。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::base_system::file_utils::{remove_file_quiet, write_atomic};

const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";
const MICROS_PER_HOUR: u64 = 3600 * 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub content: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    source: Option<String>,
    created_at_us: u64,
    last_accessed_us: u64,
    content_type: String,
    size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictReport {
    pub removed: usize,
    pub remaining_bytes: u64,
}

pub struct DiskImageCache {
    dir: PathBuf,
    lock: Mutex<()>,
    last_stamp: AtomicU64,
}

impl DiskImageCache {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
            last_stamp: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache_key(url: &str, source: Option<&str>) -> String {
        let normalized = format!(
            "{}:{}",
            source.unwrap_or("").trim().to_lowercase(),
            url.trim()
        );
        hex::encode(Sha256::digest(normalized.as_bytes()))
    }

    pub(crate) fn entry_paths(&self, url: &str, source: Option<&str>) -> (PathBuf, PathBuf) {
        self.paths_for_key(&Self::cache_key(url, source))
    }

    fn paths_for_key(&self, key: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{key}.bin")),
            self.dir.join(format!("{key}.json")),
        )
    }

    /// 单调递增的微秒时间戳：同一微秒内的多次访问仍能区分先后。
    fn stamp(&self) -> u64 {
        let now = now_us();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // 锁内只有文件操作，poison 不会留下半更新的内存状态
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, url: &str, source: Option<&str>, ttl_hours: u64) -> Option<CachedImage> {
        if ttl_hours == 0 {
            return None;
        }
        let (data_path, meta_path) = self.entry_paths(url, source);

        let _g = self.guard();
        if !data_path.exists() || !meta_path.exists() {
            return None;
        }

        let Some(mut meta) = read_meta(&meta_path) else {
            debug!(target: "cache", url, "unreadable metadata, dropping entry");
            delete_entry(&data_path, &meta_path);
            return None;
        };
        if meta.created_at_us == 0 {
            delete_entry(&data_path, &meta_path);
            return None;
        }

        let now = now_us();
        let ttl_us = ttl_hours.saturating_mul(MICROS_PER_HOUR);
        if now.saturating_sub(meta.created_at_us) > ttl_us {
            debug!(target: "cache", url, "entry expired");
            delete_entry(&data_path, &meta_path);
            return None;
        }

        let content = match fs::read(&data_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(target: "cache", url, error = %e, "cached payload unreadable");
                delete_entry(&data_path, &meta_path);
                return None;
            }
        };

        meta.last_accessed_us = self.stamp();
        meta.size = content.len() as u64;
        if let Err(e) = write_meta(&meta_path, &meta) {
            warn!(target: "cache", url, error = %e, "failed to refresh access time");
            delete_entry(&data_path, &meta_path);
            return None;
        }

        Some(CachedImage {
            content,
            content_type: meta.content_type,
        })
    }

    /// 写入缓存并执行淘汰。返回是否实际写入。
    pub fn put(
        &self,
        url: &str,
        source: Option<&str>,
        content: &[u8],
        content_type: Option<&str>,
        max_bytes: u64,
        ttl_hours: u64,
    ) -> bool {
        if max_bytes == 0 || ttl_hours == 0 {
            return false;
        }
        if content.len() as u64 > max_bytes {
            debug!(target: "cache", url, size = content.len(), max_bytes, "payload larger than budget, not cached");
            return false;
        }

        let (data_path, meta_path) = self.entry_paths(url, source);
        let _g = self.guard();

        let now = self.stamp();
        let meta = EntryMeta {
            url: url.to_string(),
            source: source.map(str::to_string),
            created_at_us: now,
            last_accessed_us: now,
            content_type: content_type
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            size: content.len() as u64,
        };

        if let Err(e) = write_atomic(&data_path, content).and_then(|_| write_meta(&meta_path, &meta))
        {
            warn!(target: "cache", url, error = %e, "cache write failed");
            delete_entry(&data_path, &meta_path);
            return false;
        }

        self.evict_locked(max_bytes, ttl_hours);
        true
    }

    pub fn evict(&self, max_bytes: u64, ttl_hours: u64) -> EvictReport {
        let _g = self.guard();
        self.evict_locked(max_bytes, ttl_hours)
    }

    fn evict_locked(&self, max_bytes: u64, ttl_hours: u64) -> EvictReport {
        let now = now_us();
        let ttl_us = ttl_hours.saturating_mul(MICROS_PER_HOUR);
        let mut removed = 0usize;
        let mut live: Vec<(PathBuf, PathBuf, EntryMeta)> = Vec::new();

        for (key, ext) in self.scan() {
            let (data_path, meta_path) = self.paths_for_key(&key);
            match ext {
                EntryFile::Data => {
                    if data_path.exists() && !meta_path.exists() {
                        remove_file_quiet(&data_path);
                        removed += 1;
                    }
                }
                EntryFile::Meta => {
                    if !data_path.exists() {
                        remove_file_quiet(&meta_path);
                        removed += 1;
                        continue;
                    }
                    let Some(mut meta) = read_meta(&meta_path) else {
                        delete_entry(&data_path, &meta_path);
                        removed += 1;
                        continue;
                    };
                    if meta.created_at_us == 0
                        || (ttl_us > 0 && now.saturating_sub(meta.created_at_us) > ttl_us)
                    {
                        delete_entry(&data_path, &meta_path);
                        removed += 1;
                        continue;
                    }
                    meta.size = fs::metadata(&data_path).map(|m| m.len()).unwrap_or(meta.size);
                    live.push((data_path, meta_path, meta));
                }
            }
        }

        let mut total: u64 = live.iter().map(|(_, _, m)| m.size).sum();
        if total > max_bytes {
            live.sort_by_key(|(_, _, m)| {
                if m.last_accessed_us > 0 {
                    m.last_accessed_us
                } else {
                    m.created_at_us
                }
            });
            for (data_path, meta_path, meta) in &live {
                if total <= max_bytes {
                    break;
                }
                debug!(target: "cache", url = %meta.url, size = meta.size, "evicting least recently used entry");
                delete_entry(data_path, meta_path);
                total = total.saturating_sub(meta.size);
                removed += 1;
            }
        }

        EvictReport {
            removed,
            remaining_bytes: total,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let _g = self.guard();
        let mut stats = CacheStats::default();
        for (key, ext) in self.scan() {
            if ext != EntryFile::Data {
                continue;
            }
            let (data_path, meta_path) = self.paths_for_key(&key);
            if !meta_path.exists() {
                continue;
            }
            stats.entries += 1;
            stats.total_bytes += fs::metadata(&data_path).map(|m| m.len()).unwrap_or(0);
        }
        stats
    }

    pub fn clear(&self) -> usize {
        let _g = self.guard();
        let mut removed = 0;
        for (key, ext) in self.scan() {
            let (data_path, meta_path) = self.paths_for_key(&key);
            match ext {
                EntryFile::Data => remove_file_quiet(&data_path),
                EntryFile::Meta => {
                    remove_file_quiet(&meta_path);
                    removed += 1;
                }
            }
        }
        removed
    }

    fn scan(&self) -> Vec<(String, EntryFile)> {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        rd.filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let path = e.path();
                let stem = path.file_stem()?.to_str()?.to_string();
                let kind = match path.extension()?.to_str()? {
                    "bin" => EntryFile::Data,
                    "json" => EntryFile::Meta,
                    _ => return None,
                };
                Some((stem, kind))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryFile {
    Data,
    Meta,
}

fn read_meta(path: &Path) -> Option<EntryMeta> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn write_meta(path: &Path, meta: &EntryMeta) -> io::Result<()> {
    let bytes = serde_json::to_vec(meta).map_err(io::Error::other)?;
    write_atomic(path, &bytes)
}

fn delete_entry(data_path: &Path, meta_path: &Path) {
    remove_file_quiet(data_path);
    remove_file_quiet(meta_path);
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Option<&str> = Some("mangahere:en");

    fn cache() -> (tempfile::TempDir, DiskImageCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskImageCache::open(dir.path().join("image-cache")).unwrap();
        (dir, cache)
    }

    #[test]
    fn hit_returns_identical_bytes_and_type() {
        let (_d, cache) = cache();
        let url = "https://example.com/c1.jpg";
        assert!(cache.put(url, SRC, b"abc123", Some("image/webp"), 1024, 1));

        let hit = cache.get(url, SRC, 1).unwrap();
        assert_eq!(hit.content, b"abc123");
        assert_eq!(hit.content_type, "image/webp");

        // ttl 0 means caching disabled for reads
        assert!(cache.get(url, SRC, 0).is_none());
        // entry survives a disabled read
        assert!(cache.get(url, SRC, 1).is_some());
    }

    #[test]
    fn keys_are_source_scoped_and_normalized() {
        let (_d, cache) = cache();
        cache.put("https://example.com/a.jpg", Some(" MangaHere:EN "), b"a", None, 64, 1);

        assert!(cache.get("  https://example.com/a.jpg ", SRC, 1).is_some());
        assert!(cache.get("https://example.com/a.jpg", Some("other"), 1).is_none());
        assert!(cache.get("https://example.com/a.jpg", None, 1).is_none());
        assert_eq!(
            cache.get("https://example.com/a.jpg", SRC, 1).unwrap().content_type,
            "image/jpeg"
        );
    }

    #[test]
    fn expired_entry_misses_and_is_removed() {
        let (_d, cache) = cache();
        let url = "https://example.com/old.jpg";
        cache.put(url, SRC, b"old", None, 1024, 1);

        let (data_path, meta_path) = cache.entry_paths(url, SRC);
        let mut meta = read_meta(&meta_path).unwrap();
        meta.created_at_us = now_us() - 2 * MICROS_PER_HOUR;
        write_meta(&meta_path, &meta).unwrap();

        assert!(cache.get(url, SRC, 1).is_none());
        assert!(!data_path.exists());
        assert!(!meta_path.exists());
    }

    #[test]
    fn corrupt_metadata_is_a_silent_miss() {
        let (_d, cache) = cache();
        let url = "https://example.com/x.jpg";
        cache.put(url, SRC, b"x", None, 1024, 1);
        let (data_path, meta_path) = cache.entry_paths(url, SRC);
        fs::write(&meta_path, b"{garbage").unwrap();

        assert!(cache.get(url, SRC, 1).is_none());
        assert!(!data_path.exists());

        cache.put(url, SRC, b"x", None, 1024, 1);
        let mut meta = read_meta(&meta_path).unwrap();
        meta.created_at_us = 0;
        write_meta(&meta_path, &meta).unwrap();
        assert!(cache.get(url, SRC, 1).is_none());
    }

    #[test]
    fn lru_eviction_keeps_recently_touched_entries() {
        let (_d, cache) = cache();
        let a = "https://example.com/a.jpg";
        let b = "https://example.com/b.jpg";
        let c = "https://example.com/c.jpg";
        let s = Some("s");

        assert!(cache.put(a, s, &[b'a'; 8], Some("image/jpeg"), 32, 24));
        assert!(cache.put(b, s, &[b'b'; 8], Some("image/jpeg"), 32, 24));
        assert!(cache.get(b, s, 24).is_some());
        assert!(cache.put(c, s, &[b'c'; 20], Some("image/jpeg"), 32, 24));

        assert!(cache.get(a, s, 24).is_none());
        assert!(cache.get(b, s, 24).is_some());
        assert!(cache.get(c, s, 24).is_some());
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 2,
                total_bytes: 28
            }
        );
    }

    #[test]
    fn oversized_or_disabled_puts_are_rejected() {
        let (_d, cache) = cache();
        let url = "https://example.com/huge.jpg";
        assert!(!cache.put(url, SRC, &[0u8; 33], None, 32, 24));
        assert!(cache.get(url, SRC, 24).is_none());

        assert!(!cache.put(url, SRC, b"tiny", None, 0, 24));
        assert!(!cache.put(url, SRC, b"tiny", None, 32, 0));
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn evict_removes_orphans_and_respects_budget() {
        let (_d, cache) = cache();
        for i in 0..4 {
            cache.put(&format!("https://example.com/{i}.jpg"), SRC, &[1u8; 10], None, 1024, 24);
        }
        fs::write(cache.dir().join("deadbeef.bin"), b"orphan").unwrap();
        fs::write(cache.dir().join("cafebabe.json"), b"{}").unwrap();
        fs::write(cache.dir().join("notes.txt"), b"keep me").unwrap();

        let report = cache.evict(25, 24);
        assert_eq!(report.remaining_bytes, 20);
        assert_eq!(report.removed, 4);
        assert!(!cache.dir().join("deadbeef.bin").exists());
        assert!(!cache.dir().join("cafebabe.json").exists());
        assert!(cache.dir().join("notes.txt").exists());

        // the two newest survive
        assert!(cache.get("https://example.com/3.jpg", SRC, 24).is_some());
        assert!(cache.get("https://example.com/2.jpg", SRC, 24).is_some());
        assert!(cache.get("https://example.com/0.jpg", SRC, 24).is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let (_d, cache) = cache();
        cache.put("https://example.com/1.jpg", SRC, b"1", None, 1024, 24);
        cache.put("https://example.com/2.jpg", SRC, b"2", None, 1024, 24);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
