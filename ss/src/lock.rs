//! Advisory, time-boxed exclusive locks shared between processes
//!
//! A lock is the file `locks/<name>.lock` holding [`LockInfo`] as JSON. It is
//! created by hard-linking a fully written temp file into place, so the lock
//! either does not exist or exists with complete metadata. Breaking a stale
//! lock, refreshing a lease and releasing all run under an `flock` on
//! `locks/.<name>.guard` and re-check the holder's token first.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::DEFAULT_LOCK_LEASE_SECS;
use crate::audit::{AuditEntry, AuditLog};
use crate::clock::SharedClock;
use crate::error::{StoreError, StoreResult, io_at};
use crate::record::{decode_id, encode_id};
use crate::store::write_atomic;

const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Metadata stored inside a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub name: String,
    pub owner: String,
    /// Unique per acquisition; guards against breaking a lock that was re-taken
    pub token: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

enum Attempt {
    Acquired(LockInfo),
    Contended,
    Retry,
}

/// Acquires and releases named locks under one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    clock: SharedClock,
    lease: Duration,
    audit: Option<AuditLog>,
}

impl LockManager {
    pub fn new(dir: impl AsRef<Path>, clock: SharedClock) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
        Ok(Self {
            dir,
            clock,
            lease: Duration::from_secs(DEFAULT_LOCK_LEASE_SECS),
            audit: None,
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Record broken locks in the audit log
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", encode_id(name)))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(".{}.guard", encode_id(name)))
    }

    fn new_info(&self, name: &str, owner: &str) -> LockInfo {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(1));
        LockInfo {
            name: name.to_string(),
            owner: owner.to_string(),
            token: Uuid::now_v7().to_string(),
            pid: std::process::id(),
            host: hostname().to_string(),
            acquired_at: now,
            expires_at: now + lease,
        }
    }

    /// Try to take `name` for `owner`, polling until `timeout` elapses
    ///
    /// Returns the new holder record on success and `Ok(None)` on timeout.
    /// Every acquisition gets a fresh token; an owner that already holds the
    /// lock through another handle waits like any other contender.
    pub fn acquire(&self, name: &str, owner: &str, timeout: Duration) -> StoreResult<Option<LockInfo>> {
        debug!(name, owner, ?timeout, "LockManager::acquire: called");
        if name.is_empty() {
            return Err(StoreError::InvalidId("empty lock name".to_string()));
        }
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;

        loop {
            match self.try_acquire(name, owner)? {
                Attempt::Acquired(info) => {
                    debug!(name, owner, token = %info.token, "LockManager::acquire: acquired");
                    return Ok(Some(info));
                }
                Attempt::Retry => continue,
                Attempt::Contended => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(name, owner, "LockManager::acquire: timed out");
                return Ok(None);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    fn try_acquire(&self, name: &str, owner: &str) -> StoreResult<Attempt> {
        let path = self.lock_path(name);
        let info = self.new_info(name, owner);
        let bytes = encode_info(&info)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(io_at(&self.dir))?;
        tmp.write_all(&bytes).map_err(io_at(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_at(tmp.path()))?;

        match fs::hard_link(tmp.path(), &path) {
            Ok(()) => return Ok(Attempt::Acquired(info)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_at(&path)(e)),
        }
        drop(tmp);

        match read_info(&path) {
            Ok(Some(holder)) if self.is_stale(&holder) => {
                self.break_lock(name, Some(&holder.token), owner)?;
                Ok(Attempt::Retry)
            }
            Ok(Some(_)) => Ok(Attempt::Contended),
            Ok(None) => Ok(Attempt::Retry),
            Err(_) if self.unreadable_is_abandoned(&path) => {
                self.break_lock(name, None, owner)?;
                Ok(Attempt::Retry)
            }
            Err(_) => Ok(Attempt::Contended),
        }
    }

    /// Extend the lease of the acquisition identified by `token`
    ///
    /// Returns `Ok(None)` when that acquisition no longer holds the lock.
    pub fn refresh(&self, name: &str, token: &str) -> StoreResult<Option<LockInfo>> {
        debug!(name, token, "LockManager::refresh: called");
        self.with_guard(name, || {
            let path = self.lock_path(name);
            match read_info(&path) {
                Ok(Some(current)) if current.token == token => {
                    let fresh = self.new_info(name, &current.owner);
                    let refreshed = LockInfo {
                        token: current.token,
                        acquired_at: current.acquired_at,
                        ..fresh
                    };
                    write_atomic(&path, &encode_info(&refreshed)?)?;
                    debug!(name, owner = %refreshed.owner, "LockManager::refresh: lease extended");
                    Ok(Some(refreshed))
                }
                Ok(Some(current)) => {
                    warn!(name, holder = %current.owner, "Refresh by a stale acquisition ignored");
                    Ok(None)
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        if info.is_expired(self.clock.now()) {
            return true;
        }
        info.host == hostname() && !pid_alive(info.pid)
    }

    fn unreadable_is_abandoned(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age >= self.lease)
    }

    /// Remove the lock if it still carries `token` (or is still unreadable when `None`)
    fn break_lock(&self, name: &str, token: Option<&str>, actor: &str) -> StoreResult<Option<LockInfo>> {
        self.with_guard(name, || {
            let path = self.lock_path(name);
            let current = read_info(&path);
            let broken = match (&current, token) {
                (Ok(Some(info)), Some(token)) if info.token == token => Some(info.clone()),
                (Err(_), None) => None,
                _ => return Ok(None),
            };

            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(io_at(&path)(e)),
            }

            let detail = match &broken {
                Some(info) => {
                    warn!(
                        name,
                        holder = %info.owner,
                        pid = info.pid,
                        host = %info.host,
                        expires_at = %info.expires_at,
                        "Broke stale lock"
                    );
                    serde_json::json!({
                        "holder": info.owner,
                        "pid": info.pid,
                        "host": info.host,
                        "expires_at": info.expires_at,
                    })
                }
                None => {
                    warn!(name, "Broke unreadable lock");
                    serde_json::json!({ "holder": null, "reason": "unreadable" })
                }
            };
            if let Some(audit) = &self.audit {
                let entry = AuditEntry::new(self.clock.now(), actor, "lock-broken", name).with_detail(detail);
                if let Err(e) = audit.append(&entry) {
                    warn!(error = %e, "LockManager::break_lock: failed to write audit entry");
                }
            }
            Ok(broken)
        })
    }

    /// Release `name` if the acquisition identified by `token` still holds it
    ///
    /// Releasing a lock that was broken or re-taken since is a logged no-op
    /// returning `false`.
    pub fn release(&self, name: &str, token: &str) -> StoreResult<bool> {
        debug!(name, token, "LockManager::release: called");
        self.with_guard(name, || {
            let path = self.lock_path(name);
            match read_info(&path) {
                Ok(Some(info)) if info.token == token => {
                    fs::remove_file(&path).map_err(io_at(&path))?;
                    Ok(true)
                }
                Ok(Some(info)) => {
                    warn!(name, token, holder = %info.owner, "Release by non-holder ignored (lock may have been broken)");
                    Ok(false)
                }
                Ok(None) => {
                    warn!(name, token, "Release of a lock that is not held");
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Current holder of `name`, if any
    pub fn holder(&self, name: &str) -> StoreResult<Option<LockInfo>> {
        read_info(&self.lock_path(name))
    }

    /// Every lock currently on disk, sorted by name
    pub fn list(&self) -> StoreResult<Vec<LockInfo>> {
        let mut locks = Vec::new();
        for name in self.lock_names()? {
            match self.holder(&name) {
                Ok(Some(info)) => locks.push(info),
                Ok(None) => {}
                Err(e) => warn!(name, error = %e, "LockManager::list: unreadable lock"),
            }
        }
        locks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(locks)
    }

    fn lock_names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_at(&self.dir))? {
            let path = entry.map_err(io_at(&self.dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_id) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Break every stale or abandoned lock; returns the holders that were evicted
    pub fn break_stale(&self, actor: &str) -> StoreResult<Vec<LockInfo>> {
        debug!(actor, "LockManager::break_stale: called");
        let mut broken = Vec::new();
        for name in self.lock_names()? {
            let path = self.lock_path(&name);
            match read_info(&path) {
                Ok(Some(info)) if self.is_stale(&info) => {
                    if let Some(info) = self.break_lock(&name, Some(&info.token), actor)? {
                        broken.push(info);
                    }
                }
                Err(_) if self.unreadable_is_abandoned(&path) => {
                    self.break_lock(&name, None, actor)?;
                }
                _ => {}
            }
        }
        if !broken.is_empty() {
            info!(count = broken.len(), "LockManager::break_stale: evicted stale holders");
        }
        Ok(broken)
    }

    /// Acquire and return a guard that releases on drop; `None` on timeout
    pub fn lock(&self, name: &str, owner: &str, timeout: Duration) -> StoreResult<Option<LockGuard>> {
        Ok(self.acquire(name, owner, timeout)?.map(|info| LockGuard {
            manager: self.clone(),
            info,
        }))
    }

    fn with_guard<T>(&self, name: &str, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
        let guard_path = self.guard_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)
            .map_err(io_at(&guard_path))?;
        file.lock_exclusive().map_err(io_at(&guard_path))?;
        let result = f();
        if let Err(e) = FileExt::unlock(&file) {
            warn!(?guard_path, error = %e, "LockManager::with_guard: unlock failed");
        }
        result
    }
}

/// One acquisition of a lock; releases it when dropped
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    info: LockInfo,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn owner(&self) -> &str {
        &self.info.owner
    }

    pub fn token(&self) -> &str {
        &self.info.token
    }

    /// Extend the lease; `false` if this acquisition lost the lock meanwhile
    pub fn refresh(&mut self) -> StoreResult<bool> {
        match self.manager.refresh(&self.info.name, &self.info.token)? {
            Some(info) => {
                self.info = info;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.info.name, &self.info.token) {
            warn!(name = %self.info.name, error = %e, "LockGuard::drop: release failed");
        }
    }
}

fn encode_info(info: &LockInfo) -> StoreResult<Vec<u8>> {
    serde_json::to_vec_pretty(info).map_err(|source| StoreError::Encode {
        what: format!("lock {}", info.name),
        source,
    })
}

/// `Ok(None)` when absent, `Err(Corrupt)` when present but unreadable
fn read_info(path: &Path) -> StoreResult<Option<LockInfo>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_at(path)(e)),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn hostname() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string())
    })
}

fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return true;
    }
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, system_clock};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(30);

    fn manager(temp: &TempDir) -> LockManager {
        LockManager::new(temp.path().join("locks"), system_clock()).unwrap()
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        let held = locks.acquire("global", "t1", SHORT).unwrap().unwrap();
        let holder = locks.holder("global").unwrap().unwrap();
        assert_eq!(holder, held);
        assert_eq!(holder.owner, "t1");
        assert_eq!(holder.pid, std::process::id());

        assert!(locks.acquire("global", "t2", SHORT).unwrap().is_none());
        assert!(locks.release("global", &held.token).unwrap());
        assert!(locks.holder("global").unwrap().is_none());
        assert!(locks.acquire("global", "t2", SHORT).unwrap().is_some());
    }

    #[test]
    fn test_same_owner_from_second_handle_waits() {
        let temp = TempDir::new().unwrap();
        let first = manager(&temp);
        let second = manager(&temp);

        let held = first.acquire("global", "t1", SHORT).unwrap().unwrap();
        assert!(second.acquire("global", "t1", SHORT).unwrap().is_none());
        assert!(second.lock("global", "t1", SHORT).unwrap().is_none());

        let stranger = Uuid::now_v7().to_string();
        assert!(!second.release("global", &stranger).unwrap());
        assert!(second.refresh("global", &stranger).unwrap().is_none());
        assert_eq!(first.holder("global").unwrap().unwrap().token, held.token);

        assert!(first.release("global", &held.token).unwrap());
        assert!(second.acquire("global", "t1", SHORT).unwrap().is_some());
    }

    #[test]
    fn test_guard_refresh_extends_own_lease_only() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let locks = LockManager::new(temp.path().join("locks"), clock.clone()).unwrap();

        let mut guard = locks.lock("global", "t1", SHORT).unwrap().unwrap();
        let first = locks.holder("global").unwrap().unwrap();
        clock.advance(Duration::from_secs(10));
        assert!(guard.refresh().unwrap());
        let second = locks.holder("global").unwrap().unwrap();
        assert_eq!(second.token, guard.token());
        assert_eq!(first.token, second.token);
        assert_eq!(first.acquired_at, second.acquired_at);
        assert!(second.expires_at > first.expires_at);

        // The lease lapses and another session takes over
        clock.advance(Duration::from_secs(31));
        let taken = locks.acquire("global", "t2", SHORT).unwrap().unwrap();
        assert!(!guard.refresh().unwrap());
        drop(guard);
        assert_eq!(locks.holder("global").unwrap().unwrap().token, taken.token);
    }

    #[test]
    fn test_expired_lease_is_broken_and_audited() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let audit = AuditLog::new(temp.path().join("audit.jsonl"));
        let locks = LockManager::new(temp.path().join("locks"), clock.clone())
            .unwrap()
            .with_audit(audit.clone());

        assert!(locks.acquire("global", "t1", SHORT).unwrap().is_some());
        assert!(locks.acquire("global", "t2", SHORT).unwrap().is_none());

        clock.advance(Duration::from_secs(31));
        assert!(locks.acquire("global", "t2", SHORT).unwrap().is_some());
        assert_eq!(locks.holder("global").unwrap().unwrap().owner, "t2");

        let entries = audit.by_action("lock-broken").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "global");
        assert_eq!(entries[0].actor, "t2");
        assert_eq!(entries[0].detail["holder"], "t1");
    }

    #[test]
    fn test_dead_holder_is_broken() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let mut info = locks.new_info("global", "ghost");
        info.pid = dead_pid;
        fs::write(locks.lock_path("global"), encode_info(&info).unwrap()).unwrap();

        assert!(locks.acquire("global", "t1", SHORT).unwrap().is_some());
        assert_eq!(locks.holder("global").unwrap().unwrap().owner, "t1");
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);

        let held = locks.acquire("global", "t1", SHORT).unwrap().unwrap();
        assert!(!locks.release("global", "not-a-token").unwrap());
        assert_eq!(locks.holder("global").unwrap().unwrap().owner, "t1");
        assert!(!locks.release("other", &held.token).unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);
        {
            let guard = locks.lock("integration", "t1", SHORT).unwrap().unwrap();
            assert_eq!(guard.name(), "integration");
            assert_eq!(guard.owner(), "t1");
            assert!(locks.lock("integration", "t2", SHORT).unwrap().is_none());
        }
        assert!(locks.holder("integration").unwrap().is_none());
    }

    #[test]
    fn test_unreadable_lock_respects_lease() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);
        fs::write(locks.lock_path("global"), b"garbage").unwrap();

        assert!(locks.acquire("global", "t1", SHORT).unwrap().is_none());

        let impatient = locks.clone().with_lease(Duration::ZERO);
        assert!(impatient.acquire("global", "t1", SHORT).unwrap().is_some());
    }

    #[test]
    fn test_list_and_break_stale() {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let locks = LockManager::new(temp.path().join("locks"), clock.clone()).unwrap();

        assert!(locks.acquire("global", "t1", SHORT).unwrap().is_some());
        assert!(locks.acquire("branch:feature/x", "t2", SHORT).unwrap().is_some());
        let names: Vec<_> = locks.list().unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["branch:feature/x".to_string(), "global".to_string()]);

        assert!(locks.break_stale("clean").unwrap().is_empty());
        clock.advance(Duration::from_secs(60));
        assert_eq!(locks.break_stale("clean").unwrap().len(), 2);
        assert!(locks.list().unwrap().is_empty());
    }

    #[test]
    fn test_at_most_one_holder_across_threads() {
        let temp = TempDir::new().unwrap();
        let locks = manager(&temp);
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        // Pairs of threads share an owner name, like two processes of one terminal
        let handles: Vec<_> = (0..6)
            .map(|t| {
                let locks = locks.clone();
                let inside = inside.clone();
                let entered = entered.clone();
                thread::spawn(move || {
                    let owner = format!("t{}", t % 3);
                    for _ in 0..10 {
                        let guard = locks.lock("resource", &owner, Duration::from_secs(30)).unwrap();
                        assert!(guard.is_some());
                        let concurrent = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(concurrent, 1, "two holders at once");
                        entered.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 60);
        assert!(locks.holder("resource").unwrap().is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0usize..3).prop_map(Op::Acquire), (0usize..3).prop_map(Op::Release)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_lock_matches_single_holder_model(ops in proptest::collection::vec(op(), 1..30)) {
            let temp = TempDir::new().unwrap();
            let locks = manager(&temp);
            // Each session remembers the token of its latest acquisition attempt
            let mut tokens: Vec<Option<String>> = vec![None; 3];
            let mut holder: Option<usize> = None;

            for op in ops {
                match op {
                    Op::Acquire(o) => {
                        let got = locks.acquire("r", &format!("s{}", o), Duration::ZERO).unwrap();
                        prop_assert_eq!(got.is_some(), holder.is_none());
                        if let Some(info) = got {
                            tokens[o] = Some(info.token);
                            holder = Some(o);
                        }
                    }
                    Op::Release(o) => {
                        let released = match &tokens[o] {
                            Some(token) => locks.release("r", token).unwrap(),
                            None => false,
                        };
                        prop_assert_eq!(released, holder == Some(o));
                        if released {
                            holder = None;
                        }
                    }
                }
                let on_disk = locks.holder("r").unwrap().map(|i| i.owner);
                prop_assert_eq!(on_disk, holder.map(|h| format!("s{}", h)));
            }
        }
    }
}
