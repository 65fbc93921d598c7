//! TTL cache shared through the file system
//!
//! Entries live at `cache/<category>/<key>` so every process that opens the
//! same state root sees the same values. The cache holds no authoritative
//! state: anything unreadable is a miss and is dropped.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::DEFAULT_CACHE_TTL_SECS;
use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult, io_at};
use crate::record::encode_id;
use crate::store::write_atomic;

/// Keys longer than this are stored under their SHA-256 digest
const MAX_KEY_FILE_LEN: usize = 120;

/// One cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
    pub written_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX / 1000));
        now >= self.written_at + ttl
    }
}

/// Counters for the current process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub writes: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// File-backed cache keyed by category and key
#[derive(Debug)]
pub struct Cache {
    dir: PathBuf,
    clock: SharedClock,
    default_ttl: Duration,
    overrides: HashMap<String, Duration>,
    stats: Mutex<CacheStats>,
}

impl Cache {
    pub fn new(dir: impl AsRef<Path>, clock: SharedClock) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        Ok(Self {
            dir,
            clock,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            overrides: HashMap::new(),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Use `ttl` for every entry in `category` unless `set` passes one explicitly
    pub fn with_ttl_override(mut self, category: impl Into<String>, ttl: Duration) -> Self {
        self.overrides.insert(category.into(), ttl);
        self
    }

    pub fn ttl_for(&self, category: &str) -> Duration {
        self.overrides.get(category).copied().unwrap_or(self.default_ttl)
    }

    fn category_dir(&self, category: &str) -> PathBuf {
        self.dir.join(encode_id(category))
    }

    fn entry_path(&self, category: &str, key: &str) -> PathBuf {
        let encoded = encode_id(key);
        let file = if encoded.len() > MAX_KEY_FILE_LEN {
            format!("h-{}", hex::encode(Sha256::digest(key.as_bytes())))
        } else {
            encoded
        };
        self.category_dir(category).join(file)
    }

    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_entry(&self, path: &Path) -> Option<CacheEntry> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?path, error = %e, "Cache::read_entry: unreadable entry");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(?path, error = %e, "Cache::read_entry: dropping corrupt entry");
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    /// Fresh value for (category, key), or `None`
    pub fn get(&self, category: &str, key: &str) -> Option<serde_json::Value> {
        let path = self.entry_path(category, key);
        let fresh = self
            .read_entry(&path)
            .filter(|entry| entry.key == key && !entry.is_expired(self.clock.now()));
        match fresh {
            Some(entry) => {
                debug!(category, key, "Cache::get: hit");
                self.bump(|s| s.hits += 1);
                Some(entry.value)
            }
            None => {
                debug!(category, key, "Cache::get: miss");
                self.bump(|s| s.misses += 1);
                None
            }
        }
    }

    /// Typed [`get`](Self::get); a value that no longer decodes is a miss
    pub fn get_as<T: DeserializeOwned>(&self, category: &str, key: &str) -> Option<T> {
        let value = self.get(category, key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(category, key, error = %e, "Cache::get_as: cached value has unexpected shape");
                None
            }
        }
    }

    /// Store a value; `ttl` defaults to the category's ttl
    pub fn set<T: Serialize>(&self, category: &str, key: &str, value: &T, ttl: Option<Duration>) -> StoreResult<()> {
        debug!(category, key, "Cache::set: called");
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            what: format!("cache value {}/{}", category, key),
            source,
        })?;
        let entry = CacheEntry {
            category: category.to_string(),
            key: key.to_string(),
            value,
            written_at: self.clock.now(),
            ttl_secs: ttl.unwrap_or_else(|| self.ttl_for(category)).as_secs(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|source| StoreError::Encode {
            what: format!("cache entry {}/{}", category, key),
            source,
        })?;
        write_atomic(&self.entry_path(category, key), &bytes)?;
        self.bump(|s| s.writes += 1);
        Ok(())
    }

    /// Drop one key, or the whole category when `key` is `None`; returns entries removed
    pub fn invalidate(&self, category: &str, key: Option<&str>) -> StoreResult<usize> {
        debug!(category, ?key, "Cache::invalidate: called");
        let removed = match key {
            Some(key) => {
                let path = self.entry_path(category, key);
                match fs::remove_file(&path) {
                    Ok(()) => 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(io_at(&path)(e)),
                }
            }
            None => {
                let dir = self.category_dir(category);
                let count = count_files(&dir);
                match fs::remove_dir_all(&dir) {
                    Ok(()) => count,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                    Err(e) => return Err(io_at(&dir)(e)),
                }
            }
        };
        self.bump(|s| s.invalidations += removed as u64);
        Ok(removed)
    }

    /// Invalidate several whole categories
    pub fn invalidate_all(&self, categories: &[&str]) -> StoreResult<usize> {
        let mut removed = 0;
        for category in categories {
            removed += self.invalidate(category, None)?;
        }
        Ok(removed)
    }

    /// Return the cached value or compute, store and return it
    ///
    /// With `bypass` the cache is neither read nor trusted; the fresh value is
    /// still written so later readers benefit.
    pub fn get_or_insert_with<T, E, F>(&self, category: &str, key: &str, bypass: bool, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError>,
        F: FnOnce() -> Result<T, E>,
    {
        if bypass {
            self.bump(|s| s.bypasses += 1);
        } else if let Some(value) = self.get_as::<T>(category, key) {
            return Ok(value);
        }
        let value = f()?;
        self.set(category, key, &value, None)?;
        Ok(value)
    }

    /// Delete every expired or unreadable entry; returns entries removed
    pub fn sweep_expired(&self) -> StoreResult<usize> {
        debug!(dir = ?self.dir, "Cache::sweep_expired: called");
        let now = self.clock.now();
        let mut removed = 0;
        for category in fs::read_dir(&self.dir).map_err(io_at(&self.dir))? {
            let category = category.map_err(io_at(&self.dir))?.path();
            if !category.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&category).map_err(io_at(&category))? {
                let path = entry.map_err(io_at(&category))?.path();
                let in_flight = path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(".tmp"));
                if !path.is_file() || in_flight {
                    continue;
                }
                let expired = match fs::read(&path) {
                    Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes).map_or(true, |entry| entry.is_expired(now)),
                    Err(_) => false,
                };
                if expired && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|rd| rd.filter_map(Result::ok).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}
