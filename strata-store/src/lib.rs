//! The remote's coordination and history surface.
//!
//! - `lock` - the distributed lock serializing sync/clone/init operations
//! - `snapshots` - the append-only snapshot log, the tag table, and the
//!   manifest archive
//!
//! Everything here operates through [`RemoteIo`], so the same code serves
//! path-reachable and `ssh`-reachable remotes.
//!
//! [`RemoteIo`]: strata_transport::RemoteIo

pub mod lock;
pub mod snapshots;

pub use lock::{LockError, LockGuard, LockOptions, LockRecord, SyncLock};
pub use snapshots::{SnapshotStore, StoreError, TagRecord};
