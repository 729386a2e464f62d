//! The copy-on-write (ZFS) remote backend.
//!
//! Runs on the host that owns the dataset. A sync transaction snapshots
//! the live dataset, clones it to a tx-suffixed sibling, mutates the clone
//! out of sight, then promotes and name-swaps it - atomic from any
//! reader's perspective. Init creates a tx-suffixed dataset and renames it
//! into place. Cleanup failures after the swap never fail the commit; they
//! land on the deferred list for operators.
//!
//! All `zfs` invocations go through the [`ZfsCli`] seam so the command
//! sequencing is testable without a pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use strata_core::{ManifestFile, RepoLayout, RepoPath, SnapshotRecord};
use strata_store::SnapshotStore;
use strata_transport::{ByteStream, RemoteIo, TempHandle, TempLocation, TransportError};

use crate::fsutil::move_file;
use crate::remote::{RemoteFilesystem, RemoteFsError};
use crate::txid::TxId;

/// The `zfs` command surface.
#[async_trait]
pub trait ZfsCli: Send + Sync {
    /// Run `zfs <args>`; returns stdout. Non-zero exit is an error.
    async fn run(&self, args: &[String]) -> Result<String, RemoteFsError>;

    async fn dataset_exists(&self, dataset: &str) -> Result<bool, RemoteFsError> {
        Ok(self
            .run(&args(["list", "-H", "-o", "name", dataset]))
            .await
            .is_ok())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

/// Real `zfs` binary via `tokio::process`.
pub struct SystemZfs;

#[async_trait]
impl ZfsCli for SystemZfs {
    async fn run(&self, args: &[String]) -> Result<String, RemoteFsError> {
        debug!(?args, "zfs");
        let output = tokio::process::Command::new("zfs")
            .args(args)
            .output()
            .await
            .map_err(|e| TransportError::io("spawning zfs", e))?;
        if !output.status.success() {
            return Err(RemoteFsError::Io(TransportError::Command {
                program: format!("zfs {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

enum ZfsPattern {
    /// No dataset yet: build a temp dataset, rename it into place.
    Init {
        temp_dataset: String,
        temp_mount: PathBuf,
    },
    /// Live dataset: snapshot, clone, promote, swap.
    Sync {
        temp_snapshot: String,
        clone_dataset: String,
        clone_mount: PathBuf,
    },
}

struct ZfsTx {
    id: TxId,
    pattern: ZfsPattern,
    manifest: Option<ManifestFile>,
}

impl ZfsTx {
    fn pending_root(&self) -> &Path {
        match &self.pattern {
            ZfsPattern::Init { temp_mount, .. } => temp_mount,
            ZfsPattern::Sync { clone_mount, .. } => clone_mount,
        }
    }
}

pub struct ZfsRemote {
    cli: Box<dyn ZfsCli>,
    dataset: String,
    mountpoint: PathBuf,
    store: SnapshotStore,
    tx: Option<ZfsTx>,
    deferred: Vec<String>,
}

impl ZfsRemote {
    pub fn new(cli: Box<dyn ZfsCli>, dataset: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        let mountpoint = mountpoint.into();
        let store = SnapshotStore::new(RemoteIo::Local, RepoLayout::new(mountpoint.clone()));
        Self {
            cli,
            dataset: dataset.into(),
            mountpoint,
            store,
            tx: None,
            deferred: Vec::new(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn tx_mount(&self, tx: &TxId) -> PathBuf {
        let mut name = self.mountpoint.as_os_str().to_owned();
        name.push(format!("-tx-{tx}"));
        PathBuf::from(name)
    }

    async fn best_effort(&mut self, what: &str, run: Vec<String>) {
        if let Err(error) = self.cli.run(&run).await {
            warn!(what, %error, "deferring cleanup");
            self.deferred.push(what.to_owned());
        }
    }
}

#[async_trait]
impl RemoteFilesystem for ZfsRemote {
    async fn begin(&mut self, tx: &TxId) -> Result<(), RemoteFsError> {
        if let Some(active) = &self.tx {
            return Err(RemoteFsError::TransactionActive(active.id.clone()));
        }

        let mount = self.tx_mount(tx);
        let mount_arg = format!("mountpoint={}", mount.display());
        let pattern = if self.cli.dataset_exists(&self.dataset).await? {
            let temp_snapshot = format!("{}@sync-temp-{tx}", self.dataset);
            let clone_dataset = format!("{}-tx-{tx}", self.dataset);
            self.cli
                .run(&args(["snapshot", &temp_snapshot]))
                .await?;
            self.cli
                .run(&args(["clone", "-o", &mount_arg, &temp_snapshot, &clone_dataset]))
                .await?;
            debug!(tx = %tx, clone = %clone_dataset, "cloned live dataset");
            ZfsPattern::Sync {
                temp_snapshot,
                clone_dataset,
                clone_mount: mount,
            }
        } else {
            let temp_dataset = format!("{}-tx-{tx}", self.dataset);
            self.cli
                .run(&args(["create", "-o", &mount_arg, &temp_dataset]))
                .await?;
            debug!(tx = %tx, dataset = %temp_dataset, "created init dataset");
            ZfsPattern::Init {
                temp_dataset,
                temp_mount: mount,
            }
        };

        self.tx = Some(ZfsTx {
            id: tx.clone(),
            pattern,
            manifest: None,
        });
        Ok(())
    }

    async fn stage(&mut self, path: &RepoPath, handle: TempHandle) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_ref().ok_or(RemoteFsError::NoTransaction)?;
        let temp = match handle.into_location() {
            TempLocation::Local(temp) => temp,
            TempLocation::Remote(_) => {
                return Err(RemoteFsError::HandleMismatch { path: path.clone() });
            }
        };
        let dest = path.to_fs_path(tx.pending_root());
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::io(format!("creating {}", parent.display()), e))?;
        }
        move_file(&temp, &dest)
            .await
            .map_err(|e| TransportError::io(format!("staging {}", dest.display()), e))?;
        debug!(path = %path, "staged into clone");
        Ok(())
    }

    async fn stage_symlink(&mut self, path: &RepoPath, target: &str) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_ref().ok_or(RemoteFsError::NoTransaction)?;
        let dest = path.to_fs_path(tx.pending_root());
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::io(format!("creating {}", parent.display()), e))?;
        }
        RemoteIo::Local.symlink(target, &dest).await?;
        Ok(())
    }

    async fn stage_delete(&mut self, path: &RepoPath) -> Result<(), RemoteFsError> {
        // The clone is invisible; deletes apply directly.
        let tx = self.tx.as_ref().ok_or(RemoteFsError::NoTransaction)?;
        let dest = path.to_fs_path(tx.pending_root());
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::io(format!("removing {}", dest.display()), e).into()),
        }
    }

    async fn stage_manifest(&mut self, manifest: &ManifestFile) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_mut().ok_or(RemoteFsError::NoTransaction)?;
        tx.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn read(&self, path: &RepoPath) -> Result<ByteStream, RemoteFsError> {
        let absolute = path.to_fs_path(&self.mountpoint);
        if !RemoteIo::Local.exists(&absolute).await? {
            return Err(RemoteFsError::NotFound { path: path.clone() });
        }
        Ok(RemoteIo::Local.open_stream(&absolute).await?)
    }

    async fn load_manifest(&self) -> Result<Option<ManifestFile>, RemoteFsError> {
        let layout = RepoLayout::new(self.mountpoint.clone());
        match RemoteIo::Local.read_opt(&layout.cache_manifest()).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(ManifestFile::from_json_slice(&bytes)?)),
        }
    }

    async fn commit(&mut self, tx_id: &TxId) -> Result<(), RemoteFsError> {
        let tx = self.tx.take().ok_or(RemoteFsError::NoTransaction)?;
        if tx.id != *tx_id {
            let active = tx.id.clone();
            self.tx = Some(tx);
            return Err(RemoteFsError::TransactionActive(active));
        }
        let manifest = tx.manifest.as_ref().ok_or(RemoteFsError::ManifestNotStaged)?;

        // Bookkeeping inside the still-invisible tree: manifest, archive,
        // log all become visible together at the name swap.
        let pending_store =
            SnapshotStore::new(RemoteIo::Local, RepoLayout::new(tx.pending_root().to_owned()));
        pending_store.archive(manifest).await?;
        pending_store
            .append(SnapshotRecord {
                snapshot_id: manifest.metadata.snapshot_id,
                created_at: manifest.metadata.created_at,
                created_by: manifest.metadata.created_by.clone(),
                message: manifest.metadata.message.clone(),
                previous: manifest.metadata.previous,
            })
            .await?;
        RemoteIo::Local
            .write_atomic(
                &RepoLayout::new(tx.pending_root().to_owned()).cache_manifest(),
                &manifest.to_json_vec()?,
            )
            .await?;

        let mount_arg = format!("mountpoint={}", self.mountpoint.display());
        match &tx.pattern {
            ZfsPattern::Init { temp_dataset, .. } => {
                self.cli
                    .run(&args(["rename", temp_dataset, &self.dataset]))
                    .await?;
                self.cli
                    .run(&args(["set", &mount_arg, &self.dataset]))
                    .await?;
                let initial = format!("{}@{}", self.dataset, manifest.metadata.snapshot_id);
                self.cli.run(&args(["snapshot", &initial])).await?;
            }
            ZfsPattern::Sync {
                temp_snapshot,
                clone_dataset,
                ..
            } => {
                let orphan = format!("{}-old-{}", self.dataset, tx.id);
                self.cli.run(&args(["promote", clone_dataset])).await?;
                self.cli
                    .run(&args(["rename", &self.dataset, &orphan]))
                    .await?;
                self.cli
                    .run(&args(["rename", clone_dataset, &self.dataset]))
                    .await?;
                self.cli
                    .run(&args(["set", &mount_arg, &self.dataset]))
                    .await?;

                // The swap is done; anything past here is best-effort.
                self.best_effort(
                    &format!("destroy orphaned dataset {orphan}"),
                    args(["destroy", "-r", &orphan]),
                )
                .await;
                self.best_effort(
                    &format!("destroy pre-sync snapshot {temp_snapshot}"),
                    args(["destroy", temp_snapshot]),
                )
                .await;
            }
        }

        info!(tx = %tx.id, snapshot = %manifest.metadata.snapshot_id, "remote commit complete");
        Ok(())
    }

    async fn rollback(&mut self, tx_id: &TxId) -> Result<(), RemoteFsError> {
        let tx = self.tx.take().ok_or(RemoteFsError::NoTransaction)?;
        if tx.id != *tx_id {
            warn!(began = %tx.id, asked = %tx_id, "rolling back under mismatched id");
        }
        match &tx.pattern {
            ZfsPattern::Init { temp_dataset, .. } => {
                self.cli
                    .run(&args(["destroy", "-r", temp_dataset]))
                    .await?;
            }
            ZfsPattern::Sync {
                temp_snapshot,
                clone_dataset,
                ..
            } => {
                self.cli
                    .run(&args(["destroy", "-r", clone_dataset]))
                    .await?;
                self.cli.run(&args(["destroy", temp_snapshot])).await?;
            }
        }
        info!(tx = %tx.id, "remote transaction rolled back");
        Ok(())
    }

    fn deferred_cleanups(&self) -> &[String] {
        &self.deferred
    }
}
