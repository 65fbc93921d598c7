//! SessionStore - crash-safe state shared between cooperating processes
//!
//! Every process that opens the same state root sees the same records. There
//! is no daemon and no shared memory: visibility comes from atomic renames and
//! exclusion comes from lock files.
//!
//! # Architecture
//!
//! ```text
//! <state-root>/
//! ├── global.record            # singleton records live at the root
//! ├── sessions/
//! │   ├── t1.record
//! │   └── archive/
//! ├── branches/
//! │   └── feature%2FP3-t1-....record
//! ├── locks/
//! │   ├── global.lock          # hard-linked into place, never partially written
//! │   └── .global.guard        # flock guard for break/release
//! ├── cache/
//! │   └── {category}/{key}
//! ├── backups/
//! │   └── {timestamp}/
//! └── audit.jsonl
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sessionstore::{Store, LockManager, system_clock};
//!
//! let clock = system_clock();
//! let store = Store::open(".parallax", clock.clone())?;
//! let locks = LockManager::new(store.root().join("locks"), clock)?;
//! if let Some(_guard) = locks.lock("global", "t1", Duration::from_secs(5))? {
//!     store.save(&record)?;
//! }
//! ```

mod audit;
mod cache;
mod clock;
mod error;
mod lock;
mod record;
mod store;

pub use audit::{AuditEntry, AuditLog};
pub use cache::{Cache, CacheEntry, CacheStats};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{StoreError, StoreResult};
pub use lock::{LockGuard, LockInfo, LockManager};
pub use record::{Record, decode_id, encode_id};
pub use store::{RestoreStats, Snapshot, Store};

/// File extension for persisted records
pub const RECORD_EXT: &str = "record";

/// Default cache time-to-live in seconds
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default lock lease in seconds
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 30;
