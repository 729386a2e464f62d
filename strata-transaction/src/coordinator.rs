//! The transaction coordinator.
//!
//! Composes the three collaborators into an all-or-nothing sync. Content
//! moves first, manifests after, and the remote commits before the client:
//! remote commit is the point of no return. A client commit failure after
//! it leaves the marker on disk as the recovery breadcrumb; the next
//! operation completes the client side from there.

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::{debug, info, warn};

use strata_core::{Entry, Manifest, ManifestError, ManifestFile, RepoPath, SnapshotId};
use strata_merge::{SyncPlan, plan::Conflict};
use strata_transport::{Transport, TransportError};

use crate::client::{ClientFilesystem, ClientFsError};
use crate::remote::{RemoteFilesystem, RemoteFsError};
use crate::txid::TxId;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("sync blocked by {} conflicting paths", conflicts.len())]
    Conflicts { conflicts: Vec<Conflict> },

    #[error("file {path} vanished between scan and transfer")]
    SourceVanished { path: RepoPath },

    #[error("entry for {path} is missing from the new manifest")]
    PlanManifestMismatch { path: RepoPath },

    #[error("local entry for {path} carries no content hash; re-scan with hashing enabled")]
    UnhashedLocalEntry { path: RepoPath },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Client(#[from] ClientFsError),

    #[error(transparent)]
    Remote(#[from] RemoteFsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote commit failed: {0}")]
    RemoteCommit(#[source] RemoteFsError),

    #[error(
        "snapshot {snapshot} is committed on the remote but the local commit failed; \
         the next operation will complete recovery: {source}"
    )]
    ClientCommit {
        snapshot: SnapshotId,
        #[source]
        source: ClientFsError,
    },
}

/// What a committed transaction produced.
#[derive(Debug)]
pub struct SyncOutcome {
    pub manifest: ManifestFile,
    pub tx_id: TxId,
}

/// Owns the three collaborators for the lifetime of one transaction.
/// Field order is drop order: the transport goes first, the client last,
/// the reverse of acquisition.
pub struct Coordinator {
    transport: Box<dyn Transport>,
    remote: Box<dyn RemoteFilesystem>,
    client: ClientFilesystem,
    client_began: bool,
    remote_began: bool,
    transport_began: bool,
}

impl Coordinator {
    pub fn new(
        client: ClientFilesystem,
        remote: Box<dyn RemoteFilesystem>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            remote,
            client,
            client_began: false,
            remote_began: false,
            transport_began: false,
        }
    }

    pub fn client(&self) -> &ClientFilesystem {
        &self.client
    }

    pub fn remote(&self) -> &dyn RemoteFilesystem {
        self.remote.as_ref()
    }

    /// Execute a plan that commits a new snapshot on the remote.
    ///
    /// The transaction id derives from the new manifest's hash, so two
    /// clients racing toward the same logical commit collide on one id.
    pub async fn execute(
        &mut self,
        plan: &SyncPlan,
        new_manifest: ManifestFile,
    ) -> Result<SyncOutcome, TransactionError> {
        if !plan.is_executable() {
            return Err(TransactionError::Conflicts {
                conflicts: plan.conflicts.clone(),
            });
        }
        let tx = TxId::from_manifest_hash(&new_manifest.metadata.manifest_hash);
        info!(tx = %tx, snapshot = %new_manifest.metadata.snapshot_id, "transaction start");

        if let Err(error) = self.stage_all(&tx, plan, &new_manifest).await {
            self.abort(&tx).await;
            return Err(error);
        }

        // Commit order is the crux: remote first. After it succeeds there
        // is no rollback, only forward recovery on the client.
        if let Err(error) = self.remote.commit(&tx).await {
            self.abort(&tx).await;
            return Err(TransactionError::RemoteCommit(error));
        }
        let snapshot = new_manifest.metadata.snapshot_id;
        if let Err(source) = self.client.commit(&tx).await {
            warn!(tx = %tx, %source, "client commit failed after remote commit");
            self.end_transport().await;
            return Err(TransactionError::ClientCommit { snapshot, source });
        }
        self.end_transport().await;

        info!(tx = %tx, snapshot = %snapshot, "transaction committed");
        Ok(SyncOutcome {
            manifest: new_manifest,
            tx_id: tx,
        })
    }

    /// Execute a plan that only changes the client side: clone, remote
    /// deletions propagating locally, cache refreshes. The remote is read,
    /// never mutated, and no snapshot is produced - so the transaction id
    /// falls back to timestamp-plus-randomness.
    pub async fn execute_local_update(
        &mut self,
        plan: &SyncPlan,
        target_manifest: ManifestFile,
    ) -> Result<SyncOutcome, TransactionError> {
        if !plan.is_executable() {
            return Err(TransactionError::Conflicts {
                conflicts: plan.conflicts.clone(),
            });
        }
        debug_assert!(plan.uploads.is_empty() && plan.delete_remote.is_empty());
        let tx = TxId::random();
        info!(tx = %tx, "local-update transaction start");

        let staged: Result<(), TransactionError> = async {
            self.client.begin(&tx).await?;
            self.client_began = true;
            self.transport.begin().await?;
            self.transport_began = true;

            self.stage_downloads(&tx, plan, &target_manifest).await?;
            for path in &plan.delete_local {
                self.client.stage_delete(path)?;
            }
            self.client.stage_manifest(target_manifest.clone())?;
            Ok(())
        }
        .await;
        if let Err(error) = staged {
            self.abort(&tx).await;
            return Err(error);
        }

        if let Err(source) = self.client.commit(&tx).await {
            self.abort(&tx).await;
            return Err(TransactionError::Client(source));
        }
        self.end_transport().await;

        info!(tx = %tx, "local-update transaction committed");
        Ok(SyncOutcome {
            manifest: target_manifest,
            tx_id: tx,
        })
    }

    async fn stage_all(
        &mut self,
        tx: &TxId,
        plan: &SyncPlan,
        new_manifest: &ManifestFile,
    ) -> Result<(), TransactionError> {
        self.client.begin(tx).await?;
        self.client_began = true;
        self.remote.begin(tx).await?;
        self.remote_began = true;
        self.transport.begin().await?;
        self.transport_began = true;

        for path in &plan.uploads {
            match new_manifest.entries.get(path) {
                Some(Entry::Link { target }) => {
                    self.remote.stage_symlink(path, target).await?;
                }
                Some(Entry::File { .. }) => {
                    let stream = self.open_local_with_retry(path).await?;
                    let handle = self.transport.transfer_to_remote(path, stream).await?;
                    self.remote.stage(path, handle).await?;
                }
                None => return Err(TransactionError::PlanManifestMismatch { path: path.clone() }),
            }
        }

        self.stage_downloads(tx, plan, new_manifest).await?;

        for path in &plan.delete_remote {
            self.remote.stage_delete(path).await?;
        }
        for path in &plan.delete_local {
            self.client.stage_delete(path)?;
        }

        // Cache refreshes need no staging of their own: the refreshed
        // entries are rows of the staged manifest.
        self.remote.stage_manifest(new_manifest).await?;
        self.client.stage_manifest(new_manifest.clone())?;
        Ok(())
    }

    async fn stage_downloads(
        &mut self,
        _tx: &TxId,
        plan: &SyncPlan,
        manifest: &ManifestFile,
    ) -> Result<(), TransactionError> {
        for path in &plan.downloads {
            match manifest.entries.get(path) {
                Some(Entry::Link { target }) => {
                    self.client.stage_symlink(path, target).await?;
                }
                Some(Entry::File { mtime, .. }) => {
                    let mtime = *mtime;
                    let stream = self.remote.read(path).await?;
                    let handle = self.transport.transfer_to_local(path, stream).await?;
                    self.client.stage(path, handle, Some(mtime)).await?;
                }
                None => return Err(TransactionError::PlanManifestMismatch { path: path.clone() }),
            }
        }
        Ok(())
    }

    /// A file missing between scan and transfer is retried once; persistent
    /// absence aborts the transaction (a later scan classifies it as a
    /// deletion) rather than committing a manifest that references it.
    async fn open_local_with_retry(
        &self,
        path: &RepoPath,
    ) -> Result<strata_transport::ByteStream, TransactionError> {
        for attempt in 0..2 {
            if let Some(stream) = self.client.open_file(path).await? {
                return Ok(stream);
            }
            debug!(path = %path, attempt, "upload source missing, retrying");
        }
        Err(TransactionError::SourceVanished { path: path.clone() })
    }

    /// Roll back whatever began, keeping the first error as the surfaced
    /// one; rollback failures are logged.
    async fn abort(&mut self, tx: &TxId) {
        if self.remote_began {
            if let Err(error) = self.remote.rollback(tx).await {
                warn!(tx = %tx, %error, "remote rollback failed");
            }
            self.remote_began = false;
        }
        if self.client_began {
            if let Err(error) = self.client.rollback(tx).await {
                warn!(tx = %tx, %error, "client rollback failed");
            }
            self.client_began = false;
        }
        self.end_transport().await;
    }

    async fn end_transport(&mut self) {
        if self.transport_began {
            if let Err(error) = self.transport.end().await {
                warn!(%error, "transport session close failed");
            }
            self.transport_began = false;
        }
    }
}

/// Build the new manifest M': the entry source per path follows the
/// planned action - uploads take the local entry, downloads and cache
/// refreshes take the remote entry, agreements keep the cache entry (and
/// with it the original author attribution), deletions drop out.
#[allow(clippy::too_many_arguments)]
pub fn build_new_manifest(
    local: &Manifest,
    cache: &Manifest,
    remote: &Manifest,
    plan: &SyncPlan,
    snapshot_id: SnapshotId,
    previous: Option<SnapshotId>,
    created_at: DateTime<FixedOffset>,
    created_by: impl Into<String>,
    message: Option<String>,
) -> Result<ManifestFile, TransactionError> {
    use std::collections::BTreeSet;

    use strata_merge::SyncAction;

    let uploads: BTreeSet<_> = plan.uploads.iter().collect();
    let downloads: BTreeSet<_> = plan.downloads.iter().collect();
    let deletes: BTreeSet<_> = plan
        .delete_local
        .iter()
        .chain(plan.delete_remote.iter())
        .collect();
    let refreshes: BTreeSet<_> = plan.cache_refresh.iter().collect();

    let mut entries = Manifest::new();
    for path in plan.states.keys() {
        let action = if uploads.contains(path) {
            SyncAction::Upload
        } else if downloads.contains(path) {
            SyncAction::Download
        } else if deletes.contains(path) {
            SyncAction::DeleteLocal
        } else if refreshes.contains(path) {
            SyncAction::RefreshCache
        } else {
            SyncAction::Noop
        };

        let chosen = match action {
            SyncAction::Upload => {
                let entry = local
                    .get(path)
                    .ok_or_else(|| TransactionError::PlanManifestMismatch { path: path.clone() })?;
                if let Entry::File { hash: None, .. } = entry {
                    return Err(TransactionError::UnhashedLocalEntry { path: path.clone() });
                }
                Some(entry.clone())
            }
            SyncAction::Download | SyncAction::RefreshCache => Some(
                remote
                    .get(path)
                    .ok_or_else(|| TransactionError::PlanManifestMismatch { path: path.clone() })?
                    .clone(),
            ),
            SyncAction::DeleteLocal | SyncAction::DeleteRemote => None,
            SyncAction::Noop => cache.get(path).or_else(|| remote.get(path)).cloned(),
            SyncAction::Conflict => None,
        };
        if let Some(entry) = chosen {
            entries.insert(path.clone(), entry);
        }
    }

    Ok(ManifestFile::seal(
        entries,
        snapshot_id,
        previous,
        created_at,
        created_by,
        message,
    )?)
}
