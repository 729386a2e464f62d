//! The client-side (working directory) half of a transaction.
//!
//! All mutations are staged: new content lands next to its destination as
//! `<path>.pending-<tx>` and only renames into place at commit, the cache
//! manifest is backed up before the transaction and atomically replaced at
//! commit, and a marker file records how far the transaction got so a
//! crashed client can be recovered on the next start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use strata_core::{ManifestError, ManifestFile, RepoLayout, RepoPath};
use strata_transport::{ByteStream, TempHandle, TempLocation};

use crate::txid::TxId;

#[derive(Error, Debug)]
pub enum ClientFsError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("transaction {0} already in progress")]
    TransactionActive(String),

    #[error("transaction id mismatch: began {began}, asked to finish {asked}")]
    TxMismatch { began: String, asked: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("corrupted transaction marker: {0}")]
    MarkerCorrupted(#[source] serde_json::Error),

    #[error("commit requires a staged manifest")]
    ManifestNotStaged,

    #[error("transport handle for {path} is not a local file")]
    HandleMismatch { path: RepoPath },
}

/// Helper for attaching path context to IO errors.
pub(crate) trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, ClientFsError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, ClientFsError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| ClientFsError::Io {
            context: f(),
            source,
        })
    }
}

/// What startup recovery found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted transaction.
    Clean,
    /// A crashed commit was completed; the cache now matches the snapshot
    /// the remote already holds.
    Completed { tx_id: String },
    /// An interrupted transaction was rolled back.
    RolledBack { tx_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct TxMarker {
    tx_id: String,
    started_at: DateTime<FixedOffset>,
    #[serde(default)]
    phase: MarkerPhase,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum MarkerPhase {
    /// Transaction opened; nothing promoted yet.
    #[default]
    Begun,
    /// Client commit started: the staged set is frozen and the new cache
    /// manifest bytes sit in the backup area.
    Committing {
        files: Vec<RepoPath>,
        deletes: Vec<RepoPath>,
    },
}

struct ClientTx {
    id: TxId,
    staged_files: Vec<RepoPath>,
    staged_deletes: Vec<RepoPath>,
    staged_manifest: Option<ManifestFile>,
}

/// The working directory as a transactional collaborator.
pub struct ClientFilesystem {
    layout: RepoLayout,
    tx: Option<ClientTx>,
}

const NEXT_CACHE: &str = "last-sync.json.next";

impl ClientFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: RepoLayout::new(root.into()),
            tx: None,
        }
    }

    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// The cache manifest, `None` on a never-synced working directory.
    pub async fn load_cache_manifest(&self) -> Result<Option<ManifestFile>, ClientFsError> {
        let path = self.layout.cache_manifest();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(ManifestFile::from_json_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientFsError::Io {
                context: format!("reading {}", path.display()),
                source: e,
            }),
        }
    }

    /// Open a tracked file for upload. `None` when the file has vanished
    /// since the scan; the coordinator retries once before giving up.
    pub async fn open_file(&self, path: &RepoPath) -> Result<Option<ByteStream>, ClientFsError> {
        let absolute = path.to_fs_path(self.layout.root());
        match tokio::fs::File::open(&absolute).await {
            Ok(file) => Ok(Some(Box::new(file) as ByteStream)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientFsError::Io {
                context: format!("opening {}", absolute.display()),
                source: e,
            }),
        }
    }

    /// Apply normalization renames decided by a scan. Outside transaction
    /// scope: renaming a file to its canonical spelling does not change
    /// tracked content.
    pub async fn apply_renames(
        &self,
        renames: &[(PathBuf, RepoPath)],
    ) -> Result<(), ClientFsError> {
        for (from, to) in renames {
            let to_abs = to.to_fs_path(self.layout.root());
            info!(from = %from.display(), to = %to_abs.display(), "normalizing file name");
            tokio::fs::rename(from, &to_abs)
                .await
                .io_context(|| format!("renaming {} to {}", from.display(), to_abs.display()))?;
        }
        Ok(())
    }

    pub async fn begin(&mut self, tx: &TxId) -> Result<(), ClientFsError> {
        if let Some(active) = &self.tx {
            return Err(ClientFsError::TransactionActive(active.id.to_string()));
        }

        let backup_dir = self.layout.backup_dir();
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .io_context(|| format!("creating {}", backup_dir.display()))?;

        let cache = self.layout.cache_manifest();
        if tokio::fs::try_exists(&cache).await.unwrap_or(false) {
            let backup = self.layout.cache_manifest_backup();
            tokio::fs::copy(&cache, &backup)
                .await
                .io_context(|| format!("backing up {}", cache.display()))?;
        }

        write_marker(
            &self.layout,
            &TxMarker {
                tx_id: tx.to_string(),
                started_at: Local::now().fixed_offset(),
                phase: MarkerPhase::Begun,
            },
        )
        .await?;

        debug!(tx = %tx, "client transaction open");
        self.tx = Some(ClientTx {
            id: tx.clone(),
            staged_files: Vec::new(),
            staged_deletes: Vec::new(),
            staged_manifest: None,
        });
        Ok(())
    }

    /// Take ownership of a downloaded temp file and stage it. When the
    /// manifest entry's mtime is given, the staged file is stamped with
    /// it, so metadata-only comparisons agree with the cache afterwards.
    pub async fn stage(
        &mut self,
        path: &RepoPath,
        handle: TempHandle,
        mtime: Option<DateTime<FixedOffset>>,
    ) -> Result<(), ClientFsError> {
        let tx = self.tx.as_mut().ok_or(ClientFsError::NoTransaction)?;
        let temp = match handle.into_location() {
            TempLocation::Local(temp) => temp,
            TempLocation::Remote(_) => {
                return Err(ClientFsError::HandleMismatch { path: path.clone() });
            }
        };

        let pending = pending_path(self.layout.root(), path, &tx.id);
        if let Some(parent) = pending.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        move_file(&temp, &pending).await?;
        if let Some(mtime) = mtime {
            let stamp = filetime::FileTime::from_unix_time(
                mtime.timestamp(),
                mtime.timestamp_subsec_nanos(),
            );
            filetime::set_file_mtime(&pending, stamp)
                .io_context(|| format!("stamping mtime on {}", pending.display()))?;
        }
        tx.staged_files.push(path.clone());
        debug!(path = %path, "staged download");
        Ok(())
    }

    /// Stage a symlink from its manifest entry.
    pub async fn stage_symlink(
        &mut self,
        path: &RepoPath,
        target: &str,
    ) -> Result<(), ClientFsError> {
        let tx = self.tx.as_mut().ok_or(ClientFsError::NoTransaction)?;
        let pending = pending_path(self.layout.root(), path, &tx.id);
        if let Some(parent) = pending.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        remove_if_exists(&pending).await?;
        tokio::fs::symlink(target, &pending)
            .await
            .io_context(|| format!("creating symlink {}", pending.display()))?;
        tx.staged_files.push(path.clone());
        debug!(path = %path, target, "staged symlink");
        Ok(())
    }

    pub fn stage_delete(&mut self, path: &RepoPath) -> Result<(), ClientFsError> {
        let tx = self.tx.as_mut().ok_or(ClientFsError::NoTransaction)?;
        tx.staged_deletes.push(path.clone());
        Ok(())
    }

    pub fn stage_manifest(&mut self, manifest: ManifestFile) -> Result<(), ClientFsError> {
        let tx = self.tx.as_mut().ok_or(ClientFsError::NoTransaction)?;
        tx.staged_manifest = Some(manifest);
        Ok(())
    }

    /// Promote everything staged: rename pending files into place, apply
    /// deletes, atomically replace the cache manifest, clear the backup
    /// area.
    pub async fn commit(&mut self, tx_id: &TxId) -> Result<(), ClientFsError> {
        let tx = self.tx.take().ok_or(ClientFsError::NoTransaction)?;
        if tx.id != *tx_id {
            let began = tx.id.to_string();
            self.tx = Some(tx);
            return Err(ClientFsError::TxMismatch {
                began,
                asked: tx_id.to_string(),
            });
        }
        let manifest = tx
            .staged_manifest
            .as_ref()
            .ok_or(ClientFsError::ManifestNotStaged)?;
        let manifest_bytes = manifest.to_json_vec()?;

        // Freeze the staged set in the marker and park the new cache bytes
        // in the backup area first: from here on, recovery can finish the
        // job if we crash.
        let next_cache = self.layout.backup_dir().join(NEXT_CACHE);
        tokio::fs::write(&next_cache, &manifest_bytes)
            .await
            .io_context(|| format!("writing {}", next_cache.display()))?;
        write_marker(
            &self.layout,
            &TxMarker {
                tx_id: tx.id.to_string(),
                started_at: Local::now().fixed_offset(),
                phase: MarkerPhase::Committing {
                    files: tx.staged_files.clone(),
                    deletes: tx.staged_deletes.clone(),
                },
            },
        )
        .await?;

        promote(
            &self.layout,
            &tx.id,
            &tx.staged_files,
            &tx.staged_deletes,
            &manifest_bytes,
        )
        .await?;

        clear_backup(&self.layout).await?;
        info!(tx = %tx.id, snapshot = %manifest.metadata.snapshot_id, "client commit complete");
        Ok(())
    }

    /// Unlink staged files, restore the cache manifest from backup, clear
    /// the marker.
    pub async fn rollback(&mut self, tx_id: &TxId) -> Result<(), ClientFsError> {
        let tx = self.tx.take().ok_or(ClientFsError::NoTransaction)?;
        if tx.id != *tx_id {
            warn!(began = %tx.id, asked = %tx_id, "rolling back under mismatched id");
        }

        for path in &tx.staged_files {
            let pending = pending_path(self.layout.root(), path, &tx.id);
            remove_if_exists(&pending).await?;
        }
        restore_cache_from_backup(&self.layout).await?;
        clear_backup(&self.layout).await?;
        info!(tx = %tx.id, "client transaction rolled back");
        Ok(())
    }

    /// Whether a previous run left an interrupted transaction behind.
    pub async fn needs_recovery(&self) -> bool {
        tokio::fs::try_exists(self.layout.tx_marker())
            .await
            .unwrap_or(false)
    }

    /// Startup recovery. With a commit-phase marker whose staged files are
    /// all present (pending or already promoted), the commit is completed;
    /// anything else rolls back to the pre-transaction state.
    pub async fn recover(&mut self) -> Result<Recovery, ClientFsError> {
        let marker_path = self.layout.tx_marker();
        let bytes = match tokio::fs::read(&marker_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Recovery::Clean),
            Err(e) => {
                return Err(ClientFsError::Io {
                    context: format!("reading {}", marker_path.display()),
                    source: e,
                });
            }
        };
        let marker: TxMarker =
            serde_json::from_slice(&bytes).map_err(ClientFsError::MarkerCorrupted)?;
        let tx_id = TxId::from_string(marker.tx_id.clone());
        info!(tx = %tx_id, "recovering interrupted transaction");

        match marker.phase {
            MarkerPhase::Begun => {
                self.rollback_from_disk(&tx_id).await?;
                Ok(Recovery::RolledBack { tx_id: marker.tx_id })
            }
            MarkerPhase::Committing { files, deletes } => {
                let next_cache = self.layout.backup_dir().join(NEXT_CACHE);
                let mut complete = tokio::fs::try_exists(&next_cache).await.unwrap_or(false);
                if complete {
                    for path in &files {
                        let pending = pending_path(self.layout.root(), path, &tx_id);
                        let final_path = path.to_fs_path(self.layout.root());
                        let present = tokio::fs::try_exists(&pending).await.unwrap_or(false)
                            || tokio::fs::symlink_metadata(&final_path).await.is_ok();
                        if !present {
                            complete = false;
                            break;
                        }
                    }
                }

                if complete {
                    let manifest_bytes =
                        tokio::fs::read(&next_cache)
                            .await
                            .io_context(|| format!("reading {}", next_cache.display()))?;
                    promote(&self.layout, &tx_id, &files, &deletes, &manifest_bytes).await?;
                    clear_backup(&self.layout).await?;
                    info!(tx = %tx_id, "completed interrupted commit");
                    Ok(Recovery::Completed { tx_id: marker.tx_id })
                } else {
                    self.rollback_from_disk(&tx_id).await?;
                    Ok(Recovery::RolledBack { tx_id: marker.tx_id })
                }
            }
        }
    }

    /// Roll back without an in-memory staged list: sweep the tree for this
    /// transaction's pending files.
    async fn rollback_from_disk(&self, tx_id: &TxId) -> Result<(), ClientFsError> {
        let suffix = format!(".pending-{tx_id}");
        let root = self.layout.root().to_owned();
        let pending = tokio::task::spawn_blocking(move || find_with_suffix(&root, &suffix))
            .await
            .map_err(|e| ClientFsError::Io {
                context: "sweeping pending files".into(),
                source: std::io::Error::other(e),
            })?
            .io_context(|| "sweeping pending files".to_string())?;
        for path in pending {
            remove_if_exists(&path).await?;
        }
        restore_cache_from_backup(&self.layout).await?;
        clear_backup(&self.layout).await?;
        Ok(())
    }
}

fn pending_path(root: &Path, path: &RepoPath, tx: &TxId) -> PathBuf {
    let mut absolute = path.to_fs_path(root).into_os_string();
    absolute.push(format!(".pending-{tx}"));
    PathBuf::from(absolute)
}

async fn move_file(from: &Path, to: &Path) -> Result<(), ClientFsError> {
    crate::fsutil::move_file(from, to)
        .await
        .io_context(|| format!("moving {} to {}", from.display(), to.display()))
}

async fn remove_if_exists(path: &Path) -> Result<(), ClientFsError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClientFsError::Io {
            context: format!("removing {}", path.display()),
            source: e,
        }),
    }
}

async fn write_marker(layout: &RepoLayout, marker: &TxMarker) -> Result<(), ClientFsError> {
    let path = layout.tx_marker();
    let mut bytes = serde_json::to_vec_pretty(marker).map_err(ClientFsError::MarkerCorrupted)?;
    bytes.push(b'\n');
    tokio::fs::write(&path, &bytes)
        .await
        .io_context(|| format!("writing {}", path.display()))
}

/// The staged→live promotion shared by commit and recovery completion.
async fn promote(
    layout: &RepoLayout,
    tx_id: &TxId,
    files: &[RepoPath],
    deletes: &[RepoPath],
    manifest_bytes: &[u8],
) -> Result<(), ClientFsError> {
    for path in files {
        let pending = pending_path(layout.root(), path, tx_id);
        let final_path = path.to_fs_path(layout.root());
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        match tokio::fs::rename(&pending, &final_path).await {
            Ok(()) => {}
            // Already promoted by the crashed run.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ClientFsError::Io {
                    context: format!("promoting {}", pending.display()),
                    source: e,
                });
            }
        }
    }

    for path in deletes {
        remove_if_exists(&path.to_fs_path(layout.root())).await?;
    }

    // Atomic cache replace: write `.new`, rename over.
    let cache = layout.cache_manifest();
    let new = PathBuf::from(format!("{}.new", cache.display()));
    if let Some(parent) = cache.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .io_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(&new, manifest_bytes)
        .await
        .io_context(|| format!("writing {}", new.display()))?;
    tokio::fs::rename(&new, &cache)
        .await
        .io_context(|| format!("installing {}", cache.display()))?;
    Ok(())
}

async fn restore_cache_from_backup(layout: &RepoLayout) -> Result<(), ClientFsError> {
    let backup = layout.cache_manifest_backup();
    if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
        let cache = layout.cache_manifest();
        tokio::fs::copy(&backup, &cache)
            .await
            .io_context(|| format!("restoring {}", cache.display()))?;
    }
    Ok(())
}

async fn clear_backup(layout: &RepoLayout) -> Result<(), ClientFsError> {
    match tokio::fs::remove_dir_all(layout.backup_dir()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClientFsError::Io {
            context: format!("clearing {}", layout.backup_dir().display()),
            source: e,
        }),
    }
}

fn find_with_suffix(root: &Path, suffix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
            {
                found.push(path);
            }
        }
    }
    Ok(found)
}
