//! The distributed lock on the remote repository.
//!
//! A single JSON record at `.dsg/sync.lock` serializes sync, clone, and
//! init operations. Acquisition is create-exclusive; a holder whose process
//! is provably dead and whose record is old enough becomes a tombstone that
//! can be reclaimed, but only by a caller presenting the stale holder's
//! record. Release is idempotent and never raises.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use strata_transport::{RemoteIo, TransportError};

/// Who holds the lock, from where, and for what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_user: String,
    pub holder_host: String,
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<FixedOffset>,
    pub tx_id: String,
}

impl LockRecord {
    /// A record for this process, timestamped now.
    pub fn for_current_process(
        user: impl Into<String>,
        operation: impl Into<String>,
        tx_id: impl Into<String>,
    ) -> Self {
        LockRecord {
            holder_user: user.into(),
            holder_host: local_hostname(),
            pid: std::process::id(),
            operation: operation.into(),
            acquired_at: Local::now().fixed_offset(),
            tx_id: tx_id.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error(
        "lock held by {} on {} (pid {}, operation {}) since {}",
        holder.holder_user, holder.holder_host, holder.pid, holder.operation, holder.acquired_at
    )]
    Contended { holder: LockRecord },

    #[error("stale lock reclamation lost to a concurrent caller")]
    StaleReclaimFailed,

    #[error("corrupted lock record: {0}")]
    Corrupted(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] TransportError),
}

/// Per-operation acquisition policy.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Age below which a holder is never considered stale.
    pub stale_after: Duration,
    /// Back-off before the single bounded retry.
    pub retry_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            retry_after: Duration::from_secs(2),
        }
    }
}

/// The lock file on one remote.
pub struct SyncLock {
    io: RemoteIo,
    path: PathBuf,
    options: LockOptions,
}

impl SyncLock {
    pub fn new(io: RemoteIo, path: PathBuf, options: LockOptions) -> Self {
        Self { io, path, options }
    }

    /// Acquire the lock for `record`, waiting at most one bounded retry.
    ///
    /// Contention resolution order: create-exclusive, then staleness check
    /// and reclamation, then a single back-off and re-attempt, then fail
    /// fast. Callers never queue.
    pub async fn acquire(&self, record: LockRecord) -> Result<LockGuard, LockError> {
        let payload = encode(&record)?;

        if self.io.write_new(&self.path, &payload).await? {
            info!(path = %self.path.display(), operation = %record.operation, "lock acquired");
            return Ok(self.guard(record));
        }

        let holder = self.read_holder().await?;
        if let Some(holder) = &holder {
            if self.is_stale(holder) {
                info!(
                    holder_user = %holder.holder_user,
                    holder_host = %holder.holder_host,
                    pid = holder.pid,
                    "reclaiming stale lock"
                );
                self.reclaim(holder.clone(), &record, &payload).await?;
                return Ok(self.guard(record));
            }
        }

        // Single bounded retry: the holder may be mid-release.
        tokio::time::sleep(self.options.retry_after).await;
        if self.io.write_new(&self.path, &payload).await? {
            info!(path = %self.path.display(), operation = %record.operation, "lock acquired after retry");
            return Ok(self.guard(record));
        }

        match self.read_holder().await? {
            Some(holder) => Err(LockError::Contended { holder }),
            // The holder released between attempts; last chance before
            // failing fast.
            None => {
                if self.io.write_new(&self.path, &payload).await? {
                    Ok(self.guard(record))
                } else {
                    Err(LockError::StaleReclaimFailed)
                }
            }
        }
    }

    fn guard(&self, record: LockRecord) -> LockGuard {
        LockGuard {
            io: self.io.clone(),
            path: self.path.clone(),
            record,
        }
    }

    async fn read_holder(&self) -> Result<Option<LockRecord>, LockError> {
        match self.io.read_opt(&self.path).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(LockError::Corrupted)?,
            )),
        }
    }

    /// A holder is stale when its record is older than the threshold and
    /// its process is not running. The process check is only possible on
    /// the holder's own host; for other hosts age alone decides.
    fn is_stale(&self, holder: &LockRecord) -> bool {
        let age = Local::now().fixed_offset() - holder.acquired_at;
        if age < chrono::Duration::from_std(self.options.stale_after).unwrap_or_default() {
            return false;
        }
        if holder.holder_host == local_hostname() {
            !pid_alive(holder.pid)
        } else {
            true
        }
    }

    /// Replace a tombstone with our record, presenting the stale holder we
    /// observed. Rename-into-place plus a confirmation read covers
    /// backends where rename-over-existing is not documented atomic.
    async fn reclaim(
        &self,
        observed: LockRecord,
        record: &LockRecord,
        payload: &[u8],
    ) -> Result<(), LockError> {
        // The tombstone must still be the holder we judged stale.
        match self.read_holder().await? {
            Some(current) if current == observed => {}
            _ => return Err(LockError::StaleReclaimFailed),
        }

        self.io.write_atomic(&self.path, payload).await?;

        // Read-after-write confirmation: did our record survive?
        match self.read_holder().await? {
            Some(current) if current.tx_id == record.tx_id => Ok(()),
            _ => Err(LockError::StaleReclaimFailed),
        }
    }
}

/// A held lock. Dropped without release, the record stays behind and ages
/// into a tombstone; callers should [`release`](LockGuard::release).
#[derive(Debug)]
pub struct LockGuard {
    io: RemoteIo,
    path: PathBuf,
    record: LockRecord,
}

impl LockGuard {
    pub fn tx_id(&self) -> &str {
        &self.record.tx_id
    }

    /// Delete the lock record. Idempotent; failures are logged, never
    /// raised.
    pub async fn release(self) {
        // Only remove the record we wrote; a reclaimed lock belongs to
        // someone else now.
        match self.io.read_opt(&self.path).await {
            Ok(Some(bytes)) => {
                match serde_json::from_slice::<LockRecord>(&bytes) {
                    Ok(current) if current.tx_id != self.record.tx_id => {
                        warn!(path = %self.path.display(), "lock was reclaimed before release");
                        return;
                    }
                    _ => {}
                }
                if let Err(error) = self.io.remove_file(&self.path).await {
                    warn!(path = %self.path.display(), %error, "failed to release lock");
                } else {
                    debug!(path = %self.path.display(), "lock released");
                }
            }
            Ok(None) => debug!(path = %self.path.display(), "lock already released"),
            Err(error) => warn!(path = %self.path.display(), %error, "failed to read lock at release"),
        }
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".into())
}

fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Signal 0 probes existence; EPERM means it exists but isn't ours.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn encode(record: &LockRecord) -> Result<Vec<u8>, LockError> {
    let mut bytes = serde_json::to_vec_pretty(record).map_err(LockError::Corrupted)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod unittests {
    use tempfile::TempDir;

    use super::*;

    fn lock(dir: &TempDir, options: LockOptions) -> SyncLock {
        SyncLock::new(RemoteIo::Local, dir.path().join("sync.lock"), options)
    }

    fn fast_options() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(300),
            retry_after: Duration::from_millis(10),
        }
    }

    fn record(tx: &str) -> LockRecord {
        LockRecord::for_current_process("alice@example.org", "sync", tx)
    }

    #[tokio::test]
    async fn acquire_creates_record_release_removes_it() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        let guard = lock.acquire(record("tx1")).await.unwrap();
        let on_disk: LockRecord =
            serde_json::from_slice(&std::fs::read(dir.path().join("sync.lock")).unwrap()).unwrap();
        assert_eq!(on_disk.tx_id, "tx1");
        assert_eq!(on_disk.operation, "sync");

        guard.release().await;
        assert!(!dir.path().join("sync.lock").exists());
    }

    #[tokio::test]
    async fn second_acquire_contends() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        let _guard = lock.acquire(record("tx1")).await.unwrap();
        let result = lock.acquire(record("tx2")).await;
        match result {
            Err(LockError::Contended { holder }) => assert_eq!(holder.tx_id, "tx1"),
            other => panic!("expected contention, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        lock.acquire(record("tx1")).await.unwrap().release().await;
        let guard = lock.acquire(record("tx2")).await.unwrap();
        assert_eq!(guard.tx_id(), "tx2");
    }

    #[tokio::test]
    async fn dead_holder_past_threshold_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock(
            &dir,
            LockOptions {
                stale_after: Duration::from_millis(0),
                retry_after: Duration::from_millis(10),
            },
        );

        // A holder on this host with a PID that cannot be running.
        let mut stale = record("tx-dead");
        stale.pid = u32::MAX / 2;
        stale.acquired_at = Local::now().fixed_offset() - chrono::Duration::hours(1);
        std::fs::write(
            dir.path().join("sync.lock"),
            serde_json::to_vec_pretty(&stale).unwrap(),
        )
        .unwrap();

        let guard = lock.acquire(record("tx-new")).await.unwrap();
        assert_eq!(guard.tx_id(), "tx-new");
    }

    #[tokio::test]
    async fn live_holder_is_not_stale_even_when_old() {
        let dir = TempDir::new().unwrap();
        let lock = lock(
            &dir,
            LockOptions {
                stale_after: Duration::from_millis(0),
                retry_after: Duration::from_millis(10),
            },
        );

        // Our own PID is definitely alive.
        let mut old = record("tx-old");
        old.acquired_at = Local::now().fixed_offset() - chrono::Duration::hours(1);
        std::fs::write(
            dir.path().join("sync.lock"),
            serde_json::to_vec_pretty(&old).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            lock.acquire(record("tx-new")).await,
            Err(LockError::Contended { .. })
        ));
    }

    #[tokio::test]
    async fn young_holder_is_not_stale() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        let mut young = record("tx-young");
        young.pid = u32::MAX / 2;
        std::fs::write(
            dir.path().join("sync.lock"),
            serde_json::to_vec_pretty(&young).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            lock.acquire(record("tx-new")).await,
            Err(LockError::Contended { .. })
        ));
    }

    #[tokio::test]
    async fn reclaim_race_loser_sees_stale_reclaim_failed() {
        let dir = TempDir::new().unwrap();
        let lock = lock(
            &dir,
            LockOptions {
                stale_after: Duration::from_millis(0),
                retry_after: Duration::from_millis(10),
            },
        );

        let mut stale = record("tx-dead");
        stale.pid = u32::MAX / 2;
        stale.acquired_at = Local::now().fixed_offset() - chrono::Duration::hours(1);
        let payload = serde_json::to_vec_pretty(&stale).unwrap();
        std::fs::write(dir.path().join("sync.lock"), &payload).unwrap();

        // Winner reclaims first.
        let winner = record("tx-winner");
        let winner_payload = encode(&winner).unwrap();
        let result = lock.reclaim(stale.clone(), &winner, &winner_payload).await;
        assert!(result.is_ok());

        // Loser still holds the old observation; its reclaim must fail.
        let loser = record("tx-loser");
        let loser_payload = encode(&loser).unwrap();
        let result = lock.reclaim(stale, &loser, &loser_payload).await;
        assert!(matches!(result, Err(LockError::StaleReclaimFailed)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        let guard = lock.acquire(record("tx1")).await.unwrap();
        std::fs::remove_file(dir.path().join("sync.lock")).unwrap();
        // Already gone: release neither panics nor errors.
        guard.release().await;
    }

    #[tokio::test]
    async fn release_leaves_reclaimed_lock_alone() {
        let dir = TempDir::new().unwrap();
        let lock = lock(&dir, fast_options());

        let guard = lock.acquire(record("tx1")).await.unwrap();
        // Someone else's record appears under the same path.
        std::fs::write(
            dir.path().join("sync.lock"),
            encode(&record("tx-other")).unwrap(),
        )
        .unwrap();

        guard.release().await;
        assert!(dir.path().join("sync.lock").exists());
    }
}
