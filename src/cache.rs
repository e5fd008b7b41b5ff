// src/cache.rs
//! Disk-backed fallback cache for GET responses.
//!
//! Each entry is a `<key>.payload` file holding the raw response bytes and a
//! `<key>.meta` sidecar holding `{timestamp, endpoint}`. Entries live for a
//! second or two: the cache shields callers from outages, it is not there to
//! save round trips. Every operation is best-effort; I/O problems are logged
//! and reported as "not cached".

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;

use crate::api::request::normalize_endpoint;

const PAYLOAD_EXT: &str = "payload";
const META_EXT: &str = "meta";
const TMP_MARKER: &str = ".tmp-";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub default_ttl: Duration,
    /// `(endpoint prefix, ttl)`; the longest matching prefix wins.
    pub ttl_overrides: Vec<(String, Duration)>,
    pub max_total_bytes: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: std::env::temp_dir().join("campus-api-cache"),
            default_ttl: Duration::from_secs(2),
            ttl_overrides: vec![("communities.php".to_string(), Duration::from_secs(1))],
            max_total_bytes: 100 * 1024 * 1024,
            max_entries: 500,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        let endpoint = normalize_endpoint(endpoint);
        self.ttl_overrides
            .iter()
            .filter(|(prefix, _)| endpoint.starts_with(prefix.trim_start_matches('/')))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    timestamp: DateTime<Utc>,
    endpoint: String,
}

/// A live entry returned by [`FallbackCache::read`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
    pub endpoint: String,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheUsage {
    pub entries: usize,
    pub total_bytes: u64,
}

struct StoredEntry {
    key: String,
    bytes: u64,
    modified: SystemTime,
}

pub struct FallbackCache {
    config: CacheConfig,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    eviction_lock: Mutex<()>,
}

impl fmt::Debug for FallbackCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackCache")
            .field("directory", &self.config.directory)
            .field("enabled", &self.config.enabled)
            .field("default_ttl", &self.config.default_ttl)
            .field("locked_keys", &self.key_locks.len())
            .finish()
    }
}

impl FallbackCache {
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "💾 Fallback cache at {} (enabled: {}, ttl {:?}, max {} entries / {} bytes)",
            config.directory.display(),
            config.enabled,
            config.default_ttl,
            config.max_entries,
            config.max_total_bytes
        );
        Self {
            config,
            key_locks: DashMap::new(),
            eviction_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        self.config.ttl_for(endpoint)
    }

    /// Returns the live entry for `key`. Expired and unreadable entries are
    /// deleted and reported as absent.
    pub async fn read(&self, key: &str) -> Option<CacheEntry> {
        self.read_live_at(key, Utc::now()).await
    }

    /// Like [`read`](Self::read), but judges expiry as of `as_of`. The
    /// failure fallback passes the instant its logical request started, so
    /// time spent in backoff does not age the entry out from under it.
    pub async fn read_live_at(&self, key: &str, as_of: DateTime<Utc>) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }
        let lock = self.lock_for(key);
        let guard = lock.lock().await;
        let entry = self.read_locked(key, as_of).await;
        drop(guard);
        drop(lock);
        self.release_lock(key);
        entry
    }

    async fn read_locked(&self, key: &str, as_of: DateTime<Utc>) -> Option<CacheEntry> {
        let meta_bytes = match fs::read(self.meta_path(key)).await {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!("Cache MISS for key: {}", key);
                // A payload without its sidecar cannot be aged; drop it.
                let _ = fs::remove_file(self.payload_path(key)).await;
                return None;
            }
        };

        let meta: EntryMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Corrupt cache metadata for key {}: {}. Removing entry", key, e);
                self.remove_files(key).await;
                return None;
            }
        };

        // Entries written after `as_of` have a negative age and count as fresh
        let age = (as_of - meta.timestamp).to_std().unwrap_or_default();
        let ttl = self.config.ttl_for(&meta.endpoint);
        if age > ttl {
            debug!("Cache entry for key {} expired ({:?} > {:?})", key, age, ttl);
            self.remove_files(key).await;
            return None;
        }

        match fs::read(self.payload_path(key)).await {
            Ok(payload) => {
                debug!("Cache HIT for key: {} (age {:?})", key, age);
                Some(CacheEntry {
                    key: key.to_string(),
                    payload,
                    stored_at: meta.timestamp,
                    endpoint: meta.endpoint,
                })
            }
            Err(e) => {
                warn!("Cache payload for key {} unreadable: {}. Removing entry", key, e);
                self.remove_files(key).await;
                None
            }
        }
    }

    /// Stores `payload` for `key`, evicting old entries first. Returns whether
    /// the entry was written.
    pub async fn write(&self, key: &str, endpoint: &str, payload: &[u8]) -> bool {
        if !self.config.enabled {
            return false;
        }
        if payload.len() as u64 > self.config.max_total_bytes {
            warn!(
                "Payload for key {} ({} bytes) exceeds the cache ceiling, not caching",
                key,
                payload.len()
            );
            return false;
        }

        let meta = EntryMeta {
            timestamp: Utc::now(),
            endpoint: normalize_endpoint(endpoint),
        };
        let meta_bytes = match serde_json::to_vec(&meta) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize cache metadata for key {}: {}", key, e);
                return false;
            }
        };

        if let Err(e) = fs::create_dir_all(&self.config.directory).await {
            warn!(
                "Cannot create cache directory {}: {}",
                self.config.directory.display(),
                e
            );
            return false;
        }

        let incoming = (payload.len() + meta_bytes.len()) as u64;
        self.evict_if_needed(key, incoming).await;

        let lock = self.lock_for(key);
        let guard = lock.lock().await;

        let written = write_atomically(&self.payload_path(key), payload).await
            && write_atomically(&self.meta_path(key), &meta_bytes).await;
        if written {
            debug!("Cache WRITE for key: {} ({} bytes)", key, payload.len());
        } else {
            self.remove_files(key).await;
        }
        drop(guard);
        drop(lock);
        self.release_lock(key);
        written
    }

    pub async fn remove(&self, key: &str) {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;
        self.remove_files(key).await;
        drop(guard);
        drop(lock);
        self.release_lock(key);
    }

    /// Deletes every cached entry.
    pub async fn clear(&self) {
        let _eviction = self.eviction_lock.lock().await;
        let entries = self.scan().await;
        let count = entries.len();
        for entry in entries {
            self.remove_files(&entry.key).await;
        }
        self.key_locks.clear();
        info!("🧹 Cleared {} cache entries", count);
    }

    pub async fn usage(&self) -> CacheUsage {
        let entries = self.scan().await;
        CacheUsage {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.bytes).sum(),
        }
    }

    /// Makes room for an `incoming`-byte entry under `key`. When either
    /// ceiling would be exceeded, the oldest 20% (at least one) are deleted,
    /// then further oldest entries until the new entry fits.
    pub async fn evict_if_needed(&self, key: &str, incoming: u64) {
        let _eviction = self.eviction_lock.lock().await;

        let mut entries = self.scan().await;
        // Overwriting an entry frees its old files first
        entries.retain(|e| e.key != key);

        let mut total: u64 = entries.iter().map(|e| e.bytes).sum();
        let max_entries = self.config.max_entries.max(1);
        let over = |total: u64, count: usize| {
            total + incoming > self.config.max_total_bytes || count + 1 > max_entries
        };
        if !over(total, entries.len()) {
            return;
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
        let batch = (entries.len() / 5).max(1);
        let mut removed = 0usize;
        let mut remaining = entries.len();

        for entry in &entries {
            if removed >= batch && !over(total, remaining) {
                break;
            }
            self.remove_files(&entry.key).await;
            total = total.saturating_sub(entry.bytes);
            remaining -= 1;
            removed += 1;
        }

        info!(
            "🧹 Evicted {} cache entries ({} left, {} bytes)",
            removed, remaining, total
        );
    }

    async fn scan(&self) -> Vec<StoredEntry> {
        let mut dir = match fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(_) => return Vec::new(),
        };

        let mut entries = Vec::new();
        let mut meta_sizes = std::collections::HashMap::new();
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.contains(TMP_MARKER) => name.to_string(),
                _ => continue,
            };
            let metadata = match item.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            if let Some(key) = name.strip_suffix(&format!(".{}", PAYLOAD_EXT)) {
                entries.push(StoredEntry {
                    key: key.to_string(),
                    bytes: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            } else if let Some(key) = name.strip_suffix(&format!(".{}", META_EXT)) {
                meta_sizes.insert(key.to_string(), metadata.len());
            }
        }

        for entry in &mut entries {
            if let Some(size) = meta_sizes.get(&entry.key) {
                entry.bytes += size;
            }
        }
        entries
    }

    async fn remove_files(&self, key: &str) {
        for path in [self.payload_path(key), self.meta_path(key)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete cache file {}: {}", path.display(), e);
                }
            }
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry for `key` once no operation holds it.
    fn release_lock(&self, key: &str) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.config.directory.join(format!("{}.{}", key, PAYLOAD_EXT))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.config.directory.join(format!("{}.{}", key, META_EXT))
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> bool {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!("{}{}{}", file_name, TMP_MARKER, uuid::Uuid::new_v4()));

    if let Err(e) = fs::write(&tmp, bytes).await {
        warn!("Failed to write cache file {}: {}", tmp.display(), e);
        let _ = fs::remove_file(&tmp).await;
        return false;
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        warn!("Failed to move cache file into place {}: {}", path.display(), e);
        let _ = fs::remove_file(&tmp).await;
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir, ttl_ms: u64) -> FallbackCache {
        FallbackCache::new(CacheConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            default_ttl: Duration::from_millis(ttl_ms),
            ttl_overrides: vec![("communities.php".to_string(), Duration::from_millis(ttl_ms / 2))],
            max_total_bytes: 10 * 1024,
            max_entries: 50,
        })
    }

    #[tokio::test]
    async fn write_then_read_returns_payload() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 2000);

        assert!(cache.write("events.php_limit_10", "events.php?limit=10", b"[1,2,3]").await);
        let entry = cache.read("events.php_limit_10").await.unwrap();
        assert_eq!(entry.payload, b"[1,2,3]".to_vec());
        assert_eq!(entry.endpoint, "events.php?limit=10");
        assert!(dir.path().join("events.php_limit_10.payload").exists());
        assert!(dir.path().join("events.php_limit_10.meta").exists());
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_read() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 60);

        cache.write("events.php", "events.php", b"{}").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.read("events.php").await.is_none());
        assert!(!dir.path().join("events.php.payload").exists());
        assert!(!dir.path().join("events.php.meta").exists());
    }

    #[tokio::test]
    async fn expiry_can_be_judged_at_an_earlier_instant() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 60);

        let request_started = Utc::now();
        cache.write("events.php", "events.php", b"[1]").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entry = cache.read_live_at("events.php", request_started).await;
        assert_eq!(entry.map(|e| e.payload), Some(b"[1]".to_vec()));

        // Judged now, the same entry is past its ttl and gets removed
        assert!(cache.read("events.php").await.is_none());
        assert!(!dir.path().join("events.php.payload").exists());
    }

    #[tokio::test]
    async fn key_locks_do_not_accumulate() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::new(CacheConfig {
            directory: dir.path().to_path_buf(),
            max_entries: 5,
            ..CacheConfig::default()
        });

        for i in 0..200 {
            assert!(cache.read(&format!("missing_{}", i)).await.is_none());
        }
        for i in 0..50 {
            cache.write(&format!("events.php_page_{}", i), "events.php", b"[]").await;
        }

        assert_eq!(cache.key_locks.len(), 0);
        assert!(cache.usage().await.entries <= 5);
    }

    #[tokio::test]
    async fn prefix_override_shortens_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 400);
        assert_eq!(cache.ttl_for("/communities.php?page=2"), Duration::from_millis(200));
        assert_eq!(cache.ttl_for("events.php"), Duration::from_millis(400));

        cache.write("communities.php", "communities.php", b"[]").await;
        cache.write("events.php", "events.php", b"[]").await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(cache.read("communities.php").await.is_none());
        assert!(cache.read("events.php").await.is_some());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 2000);

        cache.write("news.php", "news.php", b"[]").await;
        std::fs::write(dir.path().join("news.php.meta"), b"not json").unwrap();

        assert!(cache.read("news.php").await.is_none());
        assert!(!dir.path().join("news.php.payload").exists());
    }

    #[tokio::test]
    async fn eviction_keeps_store_under_ceiling() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::new(CacheConfig {
            directory: dir.path().to_path_buf(),
            max_total_bytes: 2_000,
            max_entries: 100,
            ..CacheConfig::default()
        });

        let payload = vec![b'x'; 400];
        for i in 0..20 {
            assert!(cache.write(&format!("events.php_page_{}", i), "events.php", &payload).await);
            let usage = cache.usage().await;
            assert!(usage.total_bytes <= 2_000, "usage after write {}: {:?}", i, usage);
        }

        // The newest entry always survives
        assert!(cache.read("events.php_page_19").await.is_some());
    }

    #[tokio::test]
    async fn eviction_respects_entry_ceiling() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::new(CacheConfig {
            directory: dir.path().to_path_buf(),
            max_entries: 5,
            ..CacheConfig::default()
        });

        for i in 0..12 {
            cache.write(&format!("k{}", i), "events.php", b"[]").await;
        }
        let usage = cache.usage().await;
        assert!(usage.entries <= 5);
        assert!(usage.entries >= 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::new(CacheConfig {
            directory: dir.path().to_path_buf(),
            max_total_bytes: 10,
            ..CacheConfig::default()
        });
        assert!(!cache.write("big", "big.php", &[0u8; 64]).await);
        assert_eq!(cache.usage().await, CacheUsage::default());
    }

    #[tokio::test]
    async fn clear_and_remove() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir, 2000);
        cache.write("a", "a.php", b"1").await;
        cache.write("b", "b.php", b"2").await;

        cache.remove("a").await;
        assert!(cache.read("a").await.is_none());
        assert_eq!(cache.usage().await.entries, 1);

        cache.clear().await;
        assert_eq!(cache.usage().await.entries, 0);
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let dir = TempDir::new().unwrap();
        let cache = FallbackCache::new(CacheConfig {
            enabled: false,
            directory: dir.path().to_path_buf(),
            ..CacheConfig::default()
        });
        assert!(!cache.write("events.php", "events.php", b"[]").await);
        assert!(cache.read("events.php").await.is_none());
    }

    #[tokio::test]
    async fn unusable_directory_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cache = FallbackCache::new(CacheConfig {
            directory: blocker.join("cache"),
            ..CacheConfig::default()
        });
        assert!(!cache.write("events.php", "events.php", b"[]").await);
        assert!(cache.read("events.php").await.is_none());
    }
}
