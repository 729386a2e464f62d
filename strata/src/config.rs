use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, IoContext};

/// How to reach the remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteSpec {
    /// A path reachable from this host (local disk, NFS, sshfs); staged
    /// backend.
    Path { root: PathBuf },

    /// A directory on an ssh-reachable host; staged backend, streams and
    /// file primitives go through `ssh`.
    Ssh { host: String, root: String },

    /// A ZFS dataset on this host; copy-on-write backend.
    Zfs {
        dataset: String,
        mountpoint: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Identity recorded as `created_by` on snapshots and lock records.
    pub user: String,

    /// The remote repository this working directory syncs against.
    pub remote: RemoteSpec,

    /// Seconds a lock acquisition may take for a sync before failing.
    pub sync_lock_timeout_secs: u64,

    /// Seconds a lock acquisition may take for clone and init.
    pub clone_lock_timeout_secs: u64,

    /// Age in seconds below which a lock holder is never considered stale.
    pub lock_stale_after_secs: u64,

    /// Transfer inactivity timeout in seconds.
    pub transfer_inactivity_timeout_secs: u64,

    /// Width of the content-hashing worker pool.
    pub hash_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "unknown@localhost".to_string(),
            remote: RemoteSpec::Path {
                root: PathBuf::from("/srv/strata/repo"),
            },
            sync_lock_timeout_secs: 10,
            clone_lock_timeout_secs: 30,
            lock_stale_after_secs: 300,
            transfer_inactivity_timeout_secs: 60,
            hash_workers: 8,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_inactivity_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }
}
