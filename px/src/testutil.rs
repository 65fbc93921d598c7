//! Shared helpers for unit tests that need a real repository

use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, TimeZone, Utc};
use sessionstore::{Record, Store, StoreError, system_clock};
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Initialise a repository on `main` with one empty commit
pub fn setup_git_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["commit", "--allow-empty", "-m", "initial"]);
}

/// Commit `content` to `file` on `branch`, then return to the previous branch
pub fn commit_file(dir: &Path, branch: &str, file: &str, content: &str, message: &str) {
    let previous = git(dir, &["branch", "--show-current"]);
    git(dir, &["checkout", branch]);
    let path = dir.join(file);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-m", message]);
    if !previous.is_empty() && previous != branch {
        git(dir, &["checkout", &previous]);
    }
}

/// Remove `file` on `branch` in a commit
pub fn delete_file(dir: &Path, branch: &str, file: &str, message: &str) {
    let previous = git(dir, &["branch", "--show-current"]);
    git(dir, &["checkout", branch]);
    git(dir, &["rm", "-q", file]);
    git(dir, &["commit", "-m", message]);
    if !previous.is_empty() && previous != branch {
        git(dir, &["checkout", &previous]);
    }
}

/// A fixed instant `secs` seconds into the test epoch
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
}

/// A store in a fresh temporary directory
pub fn temp_store() -> (TempDir, Store) {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path().join("state"), system_clock()).unwrap();
    (temp, store)
}

/// Write `broken` straight to its record file, then check that loading fails
/// as corrupt and that saving `valid` over it is refused, leaving the bytes as
/// they were
pub fn assert_corrupt_on_disk<R: Record>(store: &Store, broken: &R, valid: &R) {
    assert_eq!(broken.id(), valid.id());
    let path = store.path_for::<R>(broken.id()).unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let bytes = serde_json::to_vec_pretty(broken).unwrap();
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(store.load::<R>(broken.id()), Err(StoreError::Corrupt { .. })));
    assert_eq!(fs::read(&path).unwrap(), bytes);
    assert!(matches!(store.save(valid), Err(StoreError::Corrupt { .. })));
    assert_eq!(fs::read(&path).unwrap(), bytes);
}
