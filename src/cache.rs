//! Persistent TTL cache for remote manifests and content
//!
//! Layout of the cache directory:
//!
//! ```text
//! <cache dir>/
//! ├── cache-metadata.json   index of entries + hit/miss statistics
//! ├── .cache.lock           cross-process lock file
//! └── entries/<digest>.bin  cached payloads
//! ```
//!
//! Every mutation (including the counter updates made by [`ManifestCache::get`])
//! takes the lock, re-reads the index from disk, applies the change and writes
//! the index back atomically, so separate processes sharing one cache never
//! lose each other's updates.

use crate::integrity::sha256_hex;
use crate::store::write_atomic;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use fs4::fs_std::FileExt;
use glob::Pattern;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const INDEX_FILE: &str = "cache-metadata.json";
const LOCK_FILE: &str = ".cache.lock";
const ENTRIES_DIR: &str = "entries";
const INDEX_VERSION: &str = "1.0";

/// Source of "now"; injectable so expiry can be tested deterministically
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Payload path relative to the cache directory
    pub file: String,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    /// Time-to-live in seconds
    pub ttl: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    #[serde(default)]
    pub total_hits: u64,
    #[serde(default)]
    pub total_misses: u64,
    #[serde(default)]
    pub total_evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    version: String,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    total_size_bytes: u64,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    statistics: CacheStatistics,
}

impl CacheIndex {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            created_at: now,
            last_updated: now,
            total_size_bytes: 0,
            entries: BTreeMap::new(),
            statistics: CacheStatistics::default(),
        }
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        self.total_size_bytes = self.entries.values().map(|e| e.size_bytes).sum();
        self.last_updated = now;
    }
}

/// Aggregate view returned by [`ManifestCache::stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_size_bytes: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    /// hits / (hits + misses), 0 when nothing was requested
    pub hit_ratio: f64,
    pub average_age_seconds: f64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Filters for [`ManifestCache::invalidate`]. With no filters every entry matches.
#[derive(Debug, Clone, Default)]
pub struct InvalidateOptions {
    /// Glob over keys (`glob::Pattern` syntax): `*` matches any run of characters, `?` one character
    pub pattern: Option<String>,
    /// Only entries cached more than this many seconds ago
    pub older_than_seconds: Option<u64>,
    /// Report what would be removed without removing it
    pub dry_run: bool,
}

pub struct ManifestCache {
    dir: PathBuf,
    default_ttl: u64,
    clock: Clock,
    guard: Mutex<()>,
}

/// Holds the cross-process lock until dropped
struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ManifestCache {
    pub fn new<P: AsRef<Path>>(dir: P, default_ttl: u64) -> Self {
        Self::with_clock(dir, default_ttl, system_clock())
    }

    pub fn with_clock<P: AsRef<Path>>(dir: P, default_ttl: u64, clock: Clock) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            default_ttl,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn lock(&self) -> Result<IndexLock> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&file)?;
        Ok(IndexLock { file })
    }

    fn read_index(&self) -> Result<CacheIndex> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(CacheIndex::new(self.now()));
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(index) => Ok(index),
            Err(e) => {
                tracing::warn!("Cache index {} is corrupt ({}), starting fresh", path.display(), e);
                Ok(CacheIndex::new(self.now()))
            }
        }
    }

    fn write_index(&self, index: &CacheIndex) -> Result<()> {
        let content = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &content)
    }

    /// Run `f` against the on-disk index under both locks, persisting the result
    fn mutate<T>(&self, f: impl FnOnce(&mut CacheIndex, DateTime<Utc>) -> Result<T>) -> Result<T> {
        let _process = self
            .guard
            .lock()
            .map_err(|_| Error::Validation("Cache lock poisoned".to_string()))?;
        let _file = self.lock()?;

        let mut index = self.read_index()?;
        let now = self.now();
        let value = f(&mut index, now)?;
        index.recompute(now);
        self.write_index(&index)?;
        Ok(value)
    }

    fn entry_file(key: &str) -> String {
        format!("{}/{}.bin", ENTRIES_DIR, sha256_hex(key.as_bytes()))
    }

    /// Cached payload for `key`, or `None` on a miss
    ///
    /// A present but expired entry counts as a miss against both the entry and
    /// the global statistics; an absent key only against the global statistics.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let dir = self.dir.clone();
        let result = self.mutate(|index, now| {
            let Some(entry) = index.entries.get_mut(key) else {
                index.statistics.total_misses += 1;
                return Ok(None);
            };

            if entry.is_expired(now) {
                entry.misses += 1;
                index.statistics.total_misses += 1;
                return Ok(None);
            }

            match fs::read(dir.join(&entry.file)) {
                Ok(bytes) => {
                    entry.hits += 1;
                    index.statistics.total_hits += 1;
                    Ok(Some(bytes))
                }
                Err(e) => {
                    tracing::warn!("Cache payload for '{}' unreadable: {}", key, e);
                    index.entries.remove(key);
                    index.statistics.total_misses += 1;
                    Ok(None)
                }
            }
        })?;

        tracing::debug!(
            "Cache {} for '{}'",
            if result.is_some() { "hit" } else { "miss" },
            key
        );
        Ok(result)
    }

    /// Typed convenience over [`get`](Self::get). An entry that no longer
    /// deserializes is treated as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!("Discarding undecodable cache entry '{}': {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Store `content` under `key` with `ttl_seconds` (or the default TTL)
    pub fn put(&self, key: &str, content: &[u8], ttl_seconds: Option<u64>) -> Result<()> {
        let ttl = ttl_seconds.unwrap_or(self.default_ttl);
        let file = Self::entry_file(key);
        let payload_path = self.dir.join(&file);

        self.mutate(|index, now| {
            write_atomic(&payload_path, content)?;
            let expires_at = i64::try_from(ttl)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let (hits, misses) = index
                .entries
                .get(key)
                .map(|e| (e.hits, e.misses))
                .unwrap_or((0, 0));
            index.entries.insert(
                key.to_string(),
                CacheEntry {
                    file: file.clone(),
                    size_bytes: content.len() as u64,
                    cached_at: now,
                    expires_at,
                    hits,
                    misses,
                    ttl,
                },
            );
            Ok(())
        })?;

        tracing::debug!("Cached '{}' ({} bytes, ttl {}s)", key, content.len(), ttl);
        Ok(())
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes, ttl_seconds)
    }

    /// Entry metadata without touching hit/miss counters
    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let _process = self
            .guard
            .lock()
            .map_err(|_| Error::Validation("Cache lock poisoned".to_string()))?;
        Ok(self.read_index()?.entries.get(key).cloned())
    }

    /// Remove matching entries and return their keys, sorted
    pub fn invalidate(&self, options: &InvalidateOptions) -> Result<Vec<String>> {
        let matcher = match &options.pattern {
            Some(pattern) => Some(key_pattern(pattern)?),
            None => None,
        };
        let dir = self.dir.clone();

        let removed = self.mutate(|index, now| {
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(key, _)| matcher.as_ref().map_or(true, |p| p.matches(key)))
                .filter(|(_, entry)| {
                    options
                        .older_than_seconds
                        .map_or(true, |secs| (now - entry.cached_at).num_seconds() > secs as i64)
                })
                .map(|(key, _)| key.clone())
                .collect();

            if !options.dry_run {
                for key in &keys {
                    if let Some(entry) = index.entries.remove(key) {
                        let _ = fs::remove_file(dir.join(&entry.file));
                        index.statistics.total_evictions += 1;
                    }
                }
            }
            Ok(keys)
        })?;

        tracing::info!(
            "{} {} cache entr{}",
            if options.dry_run { "Would invalidate" } else { "Invalidated" },
            removed.len(),
            if removed.len() == 1 { "y" } else { "ies" }
        );
        Ok(removed)
    }

    /// Drop every expired entry; returns the removed keys
    pub fn evict_expired(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        self.mutate(|index, now| {
            let expired: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                if let Some(entry) = index.entries.remove(key) {
                    let _ = fs::remove_file(dir.join(&entry.file));
                    index.statistics.total_evictions += 1;
                }
            }
            Ok(expired)
        })
    }

    /// Remove every entry; returns how many were removed
    pub fn clear(&self) -> Result<usize> {
        Ok(self.invalidate(&InvalidateOptions::default())?.len())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let _process = self
            .guard
            .lock()
            .map_err(|_| Error::Validation("Cache lock poisoned".to_string()))?;
        let index = self.read_index()?;
        let now = self.now();

        let total_entries = index.entries.len();
        let requests = index.statistics.total_hits + index.statistics.total_misses;
        let hit_ratio = if requests == 0 {
            0.0
        } else {
            index.statistics.total_hits as f64 / requests as f64
        };
        let average_age_seconds = if total_entries == 0 {
            0.0
        } else {
            let total: f64 = index
                .entries
                .values()
                .map(|e| (now - e.cached_at).num_milliseconds() as f64 / 1000.0)
                .sum();
            total / total_entries as f64
        };

        Ok(CacheStats {
            total_entries,
            expired_entries: index.entries.values().filter(|e| e.is_expired(now)).count(),
            total_size_bytes: index.entries.values().map(|e| e.size_bytes).sum(),
            total_hits: index.statistics.total_hits,
            total_misses: index.statistics.total_misses,
            hit_ratio,
            average_age_seconds,
            oldest_entry: index.entries.values().map(|e| e.cached_at).min(),
            newest_entry: index.entries.values().map(|e| e.cached_at).max(),
        })
    }
}

fn key_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| Error::Validation(format!("Invalid cache key pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    /// Clock starting at a fixed instant, advanced manually in seconds
    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let base = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let handle = offset.clone();
        let clock: Clock = Arc::new(move || base + Duration::seconds(handle.load(Ordering::SeqCst)));
        (clock, offset)
    }

    #[test]
    fn test_hit_ratio_after_three_hits_and_one_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path(), 3600);

        assert_eq!(cache.stats().unwrap().hit_ratio, 0.0);

        assert!(cache.get("manifest/main").unwrap().is_none());
        cache.put("manifest/main", b"{}", None).unwrap();
        for _ in 0..3 {
            assert_eq!(cache.get("manifest/main").unwrap().unwrap(), b"{}");
        }

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_hits, 3);
        assert_eq!(stats.total_misses, 1);
        assert!((stats.hit_ratio - 0.75).abs() < f64::EPSILON);
        assert_eq!(cache.entry("manifest/main").unwrap().unwrap().hits, 3);
    }

    #[test]
    fn test_expired_entry_is_a_miss_but_stays_until_evicted() {
        let dir = TempDir::new().unwrap();
        let (clock, offset) = manual_clock();
        let cache = ManifestCache::with_clock(dir.path(), 60, clock);

        cache.put("k", b"value", Some(10)).unwrap();
        offset.store(10, Ordering::SeqCst);
        assert!(cache.get("k").unwrap().is_some());

        offset.store(11, Ordering::SeqCst);
        assert!(cache.get("k").unwrap().is_none());
        let entry = cache.entry("k").unwrap().unwrap();
        assert_eq!(entry.misses, 1);
        assert_eq!(cache.stats().unwrap().expired_entries, 1);

        assert_eq!(cache.evict_expired().unwrap(), vec!["k".to_string()]);
        assert!(cache.entry("k").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        ManifestCache::new(dir.path(), 3600).put("a", b"123", None).unwrap();

        let reopened = ManifestCache::new(dir.path(), 3600);
        assert_eq!(reopened.get("a").unwrap().unwrap(), b"123");
        assert_eq!(reopened.stats().unwrap().total_size_bytes, 3);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(raw["entries"]["a"]["size_bytes"], 3);
        assert_eq!(raw["statistics"]["total_hits"], 1);
    }

    #[test]
    fn test_invalidate_filters() {
        let dir = TempDir::new().unwrap();
        let (clock, offset) = manual_clock();
        let cache = ManifestCache::with_clock(dir.path(), 3600, clock);

        cache.put("manifest/main", b"1", None).unwrap();
        cache.put("manifest/mirror", b"2", None).unwrap();
        offset.store(600, Ordering::SeqCst);
        cache.put("content/main/agent/a/1.0.0", b"3", None).unwrap();

        let dry = cache
            .invalidate(&InvalidateOptions {
                pattern: Some("manifest/*".to_string()),
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dry, vec!["manifest/main", "manifest/mirror"]);
        assert_eq!(cache.stats().unwrap().total_entries, 3);

        let old = cache
            .invalidate(&InvalidateOptions {
                older_than_seconds: Some(300),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(cache.stats().unwrap().total_entries, 1);

        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().total_size_bytes, 0);
    }

    #[test]
    fn test_json_helpers() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path(), 3600);
        cache.put_json("doc", &vec![1, 2, 3], None).unwrap();
        let back: Option<Vec<u32>> = cache.get_json("doc").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let wrong: Option<String> = cache.get_json("doc").unwrap();
        assert!(wrong.is_none());
    }

    #[test]
    fn test_key_pattern() {
        let pattern = key_pattern("content/*/agent/?").unwrap();
        assert!(pattern.matches("content/main/agent/a"));
        assert!(!pattern.matches("content/main/agent/ab"));
        assert!(key_pattern("manifest/*").unwrap().matches("manifest/primary"));
        assert!(key_pattern("a.b").unwrap().matches("a.b"));
        assert!(!key_pattern("a.b").unwrap().matches("axb"));
        assert_eq!(key_pattern("content/[").unwrap_err().code(), "VALIDATION_ERROR");
    }
}
