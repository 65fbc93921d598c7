//! File-backed record store with atomic writes and snapshots

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::RECORD_EXT;
use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult, io_at};
use crate::record::{Record, decode_id, encode_id};

/// Top-level entries never captured by a snapshot and never touched by restore
const DEFAULT_BACKUP_EXCLUDES: &[&str] = &["backups", "cache", "locks", "logs", "audit.jsonl"];

/// Prefix used by in-flight temp files
const TEMP_PREFIX: &str = ".tmp";

/// A point-in-time copy of the state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Directory name under `backups/`, sortable by time
    pub name: String,
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Top-level entries removed before copying
    pub removed: usize,
    /// Files copied from the snapshot
    pub restored: usize,
}

/// Directory of records shared by every process that opens it
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    clock: SharedClock,
    backup_excludes: Vec<String>,
}

impl Store {
    /// Open or create a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, clock: SharedClock) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(io_at(&root))?;
        debug!(?root, "Store::open: opened");
        Ok(Self {
            root,
            clock,
            backup_excludes: DEFAULT_BACKUP_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Add top-level names that snapshots skip and restore leaves alone
    pub fn with_backup_excludes<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in extra {
            let name = name.into();
            if !self.backup_excludes.contains(&name) {
                self.backup_excludes.push(name);
            }
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn collection_dir<R: Record>(&self) -> PathBuf {
        match R::collection_name() {
            "" => self.root.clone(),
            name => self.root.join(name),
        }
    }

    /// Path of the file holding record `id`
    pub fn path_for<R: Record>(&self, id: &str) -> StoreResult<PathBuf> {
        if id.is_empty() {
            return Err(StoreError::InvalidId("empty identifier".to_string()));
        }
        Ok(self
            .collection_dir::<R>()
            .join(format!("{}.{}", encode_id(id), RECORD_EXT)))
    }

    pub fn exists<R: Record>(&self, id: &str) -> StoreResult<bool> {
        Ok(self.path_for::<R>(id)?.exists())
    }

    /// Load a record; `Ok(None)` when absent, `Corrupt` when it fails validation
    pub fn load<R: Record>(&self, id: &str) -> StoreResult<Option<R>> {
        let path = self.path_for::<R>(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(io_at(&path))?;
        decode::<R>(&path, id, &bytes).map(Some)
    }

    /// Atomically write a record
    ///
    /// Readers observe either the previous bytes or the new bytes. An existing
    /// file that would fail to load is never overwritten.
    pub fn save<R: Record>(&self, record: &R) -> StoreResult<()> {
        let path = self.path_for::<R>(record.id())?;
        debug!(?path, "Store::save: called");
        record.validate().map_err(|reason| StoreError::Corrupt {
            path: path.clone(),
            reason: format!("refusing to save invalid record: {}", reason),
        })?;

        if path.exists() {
            let existing = fs::read(&path).map_err(io_at(&path))?;
            if let Err(StoreError::Corrupt { reason, .. }) = decode::<R>(&path, record.id(), &existing) {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("existing file is corrupt, not overwriting: {}", reason),
                });
            }
        }

        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            what: format!("{} record", R::collection_name()),
            source,
        })?;
        write_atomic(&path, &bytes)
    }

    /// Remove a record; returns whether it existed
    pub fn delete<R: Record>(&self, id: &str) -> StoreResult<bool> {
        let path = self.path_for::<R>(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_at(&path)(e)),
        }
    }

    /// Identifiers of every record in the collection, sorted
    pub fn list_ids<R: Record>(&self) -> StoreResult<Vec<String>> {
        let dir = self.collection_dir::<R>();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_at(&dir))? {
            let path = entry.map_err(io_at(&dir))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_id(stem) {
                Some(id) => ids.push(id),
                None => warn!(?path, "Store::list_ids: undecodable file name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every record in the collection
    pub fn list<R: Record>(&self) -> StoreResult<Vec<R>> {
        let mut records = Vec::new();
        for id in self.list_ids::<R>()? {
            if let Some(record) = self.load::<R>(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Move a record into `<collection>/archive/` with a timestamp suffix
    pub fn archive<R: Record>(&self, id: &str) -> StoreResult<Option<PathBuf>> {
        let path = self.path_for::<R>(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let archive_dir = self.collection_dir::<R>().join("archive");
        fs::create_dir_all(&archive_dir).map_err(io_at(&archive_dir))?;
        let stamp = self.clock.now().format("%Y%m%d%H%M%S%3f");
        let dest = archive_dir.join(format!("{}-{}.{}", encode_id(id), stamp, RECORD_EXT));
        fs::rename(&path, &dest).map_err(io_at(&path))?;
        info!(id, ?dest, "Store::archive: archived record");
        Ok(Some(dest))
    }

    fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.backup_excludes.iter().any(|e| e == name)
    }

    /// Files a snapshot would capture, relative to the root
    fn snapshot_sources(&self) -> StoreResult<Vec<(PathBuf, u64)>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).min_depth(1).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if name.starts_with(TEMP_PREFIX) {
                return false;
            }
            entry.depth() != 1 || !self.is_excluded(&name)
        });
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                StoreError::Io {
                    path,
                    source: e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk error")),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push((rel.to_path_buf(), len));
            }
        }
        Ok(files)
    }

    /// Copy the current state into `backups/<timestamp>/`
    pub fn backup(&self) -> StoreResult<Snapshot> {
        debug!(root = ?self.root, "Store::backup: called");
        let sources = self.snapshot_sources()?;
        let bytes: u64 = sources.iter().map(|(_, len)| len).sum();

        let available = fs2::available_space(&self.root).map_err(io_at(&self.root))?;
        if available < bytes {
            return Err(StoreError::DiskSpace(format!(
                "snapshot needs {} bytes, {} available",
                bytes, available
            )));
        }

        let base = self.clock.now().format("%Y%m%d-%H%M%S-%3f").to_string();
        let mut name = base.clone();
        let mut n = 1;
        while self.backups_dir().join(&name).exists() {
            n += 1;
            name = format!("{}-{}", base, n);
        }
        let dest = self.backups_dir().join(&name);
        fs::create_dir_all(&dest).map_err(io_at(&dest))?;

        for (rel, _) in &sources {
            let to = dest.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            let from = self.root.join(rel);
            fs::copy(&from, &to).map_err(io_at(&from))?;
        }

        info!(snapshot = %name, files = sources.len(), bytes, "Store::backup: snapshot written");
        Ok(Snapshot {
            name,
            path: dest,
            files: sources.len(),
            bytes,
        })
    }

    /// Snapshots on disk, oldest first
    pub fn list_backups(&self) -> StoreResult<Vec<Snapshot>> {
        let dir = self.backups_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_at(&dir))? {
            let path = entry.map_err(io_at(&dir))?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            let (files, bytes) = WalkDir::new(&path)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .fold((0usize, 0u64), |(f, b), e| {
                    (f + 1, b + e.metadata().map(|m| m.len()).unwrap_or(0))
                });
            snapshots.push(Snapshot {
                name,
                path,
                files,
                bytes,
            });
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    /// Replace current state with the contents of a snapshot
    ///
    /// Excluded top-level entries (locks, cache, backups, logs, audit) are left as they are.
    pub fn restore(&self, name: &str) -> StoreResult<RestoreStats> {
        debug!(name, "Store::restore: called");
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(StoreError::SnapshotNotFound(name.to_string()));
        }
        let snapshot = self.backups_dir().join(name);
        if !snapshot.is_dir() {
            return Err(StoreError::SnapshotNotFound(name.to_string()));
        }

        let mut stats = RestoreStats::default();
        for entry in fs::read_dir(&self.root).map_err(io_at(&self.root))? {
            let path = entry.map_err(io_at(&self.root))?.path();
            let entry_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if self.is_excluded(&entry_name) {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path).map_err(io_at(&path))?;
            } else {
                fs::remove_file(&path).map_err(io_at(&path))?;
            }
            stats.removed += 1;
        }

        for entry in WalkDir::new(&snapshot).min_depth(1).into_iter().filter_map(Result::ok) {
            let Ok(rel) = entry.path().strip_prefix(&snapshot) else {
                continue;
            };
            let to = self.root.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&to).map_err(io_at(&to))?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent).map_err(io_at(parent))?;
                }
                fs::copy(entry.path(), &to).map_err(io_at(entry.path()))?;
                stats.restored += 1;
            }
        }

        info!(snapshot = name, removed = stats.removed, restored = stats.restored, "Store::restore: state restored");
        Ok(stats)
    }
}

/// Write `bytes` to `path` through a synced temp file in the same directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::InvalidId(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(io_at(dir))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(io_at(dir))?;
    tmp.write_all(bytes).map_err(io_at(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_at(path))?;
    persist(tmp, path)?;

    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

fn persist(tmp: NamedTempFile, path: &Path) -> StoreResult<()> {
    tmp.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Parse and validate the bytes of a record stored under `id`
fn decode<R: Record>(path: &Path, id: &str, bytes: &[u8]) -> StoreResult<R> {
    let record: R = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    record.validate().map_err(|reason| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })?;
    if record.id() != id {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("record id '{}' does not match file for '{}'", record.id(), id),
        });
    }
    Ok(record)
}
