//! The staged-directory remote backend.
//!
//! Works against any filesystem the [`RemoteIo`] primitives can reach:
//! `begin` opens a transaction-scoped staging directory under the control
//! dir, writes land there, and `commit` moves content into the live tree
//! and then swaps the manifest - the swap is the commit point readers key
//! on. History bookkeeping (archive + snapshot log) happens before the
//! swap so a new manifest never references missing records.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use strata_core::{ManifestFile, RepoLayout, RepoPath, SnapshotRecord};
use strata_store::SnapshotStore;
use strata_transport::{ByteStream, RemoteIo, TempHandle, TempLocation, TransportError};

use crate::remote::{RemoteFilesystem, RemoteFsError};
use crate::txid::TxId;

struct StagedTx {
    id: TxId,
    staging_dir: PathBuf,
    staged_files: Vec<RepoPath>,
    staged_deletes: Vec<RepoPath>,
    manifest: Option<ManifestFile>,
}

pub struct StagedRemote {
    io: RemoteIo,
    layout: RepoLayout,
    store: SnapshotStore,
    tx: Option<StagedTx>,
    deferred: Vec<String>,
}

impl StagedRemote {
    pub fn new(io: RemoteIo, root: impl Into<PathBuf>) -> Self {
        let layout = RepoLayout::new(root.into());
        let store = SnapshotStore::new(io.clone(), layout.clone());
        Self {
            io,
            layout,
            store,
            tx: None,
            deferred: Vec::new(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn staging_dir(&self, tx: &TxId) -> PathBuf {
        self.layout.control_dir().join(format!("staging-{tx}"))
    }

    fn staged_file(&self, tx: &StagedTx, path: &RepoPath) -> PathBuf {
        path.to_fs_path(&tx.staging_dir.join("files"))
    }
}

#[async_trait]
impl RemoteFilesystem for StagedRemote {
    async fn begin(&mut self, tx: &TxId) -> Result<(), RemoteFsError> {
        if let Some(active) = &self.tx {
            return Err(RemoteFsError::TransactionActive(active.id.clone()));
        }
        let staging_dir = self.staging_dir(tx);
        self.io.mkdirp(&staging_dir.join("files")).await?;
        debug!(tx = %tx, staging = %staging_dir.display(), "remote transaction open");
        self.tx = Some(StagedTx {
            id: tx.clone(),
            staging_dir,
            staged_files: Vec::new(),
            staged_deletes: Vec::new(),
            manifest: None,
        });
        Ok(())
    }

    async fn stage(&mut self, path: &RepoPath, handle: TempHandle) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_ref().ok_or(RemoteFsError::NoTransaction)?;
        let dest = self.staged_file(tx, path);
        if let Some(parent) = dest.parent() {
            self.io.mkdirp(parent).await?;
        }

        match (&self.io, handle.into_location()) {
            (RemoteIo::Local, TempLocation::Local(temp)) => {
                // The transport temp dir may sit on another filesystem.
                crate::fsutil::move_file(&temp, &dest).await.map_err(|e| {
                    TransportError::io(format!("staging {}", dest.display()), e)
                })?;
            }
            (RemoteIo::Ssh { .. }, TempLocation::Remote(temp)) => {
                self.io.rename(&PathBuf::from(temp), &dest).await?;
            }
            _ => return Err(RemoteFsError::HandleMismatch { path: path.clone() }),
        }

        let tx = self.tx.as_mut().ok_or(RemoteFsError::NoTransaction)?;
        tx.staged_files.push(path.clone());
        debug!(path = %path, "staged upload");
        Ok(())
    }

    async fn stage_symlink(&mut self, path: &RepoPath, target: &str) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_ref().ok_or(RemoteFsError::NoTransaction)?;
        let dest = self.staged_file(tx, path);
        if let Some(parent) = dest.parent() {
            self.io.mkdirp(parent).await?;
        }
        self.io.symlink(target, &dest).await?;
        let tx = self.tx.as_mut().ok_or(RemoteFsError::NoTransaction)?;
        tx.staged_files.push(path.clone());
        debug!(path = %path, target, "staged symlink");
        Ok(())
    }

    async fn stage_delete(&mut self, path: &RepoPath) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_mut().ok_or(RemoteFsError::NoTransaction)?;
        tx.staged_deletes.push(path.clone());
        Ok(())
    }

    async fn stage_manifest(&mut self, manifest: &ManifestFile) -> Result<(), RemoteFsError> {
        let tx = self.tx.as_mut().ok_or(RemoteFsError::NoTransaction)?;
        tx.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn read(&self, path: &RepoPath) -> Result<ByteStream, RemoteFsError> {
        let absolute = path.to_fs_path(self.layout.root());
        if !self.io.exists(&absolute).await? {
            return Err(RemoteFsError::NotFound { path: path.clone() });
        }
        Ok(self.io.open_stream(&absolute).await?)
    }

    async fn load_manifest(&self) -> Result<Option<ManifestFile>, RemoteFsError> {
        match self.io.read_opt(&self.layout.cache_manifest()).await? {
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

        // Content first: every file the new manifest references must be
        // live before the manifest swap makes it visible.
        for path in &tx.staged_files {
            let from = path.to_fs_path(&tx.staging_dir.join("files"));
            let to = path.to_fs_path(self.layout.root());
            if let Some(parent) = to.parent() {
                self.io.mkdirp(parent).await?;
            }
            self.io.rename(&from, &to).await?;
        }
        for path in &tx.staged_deletes {
            self.io
                .remove_file(&path.to_fs_path(self.layout.root()))
                .await?;
        }

        // History bookkeeping, still invisible to readers.
        self.store.archive(manifest).await?;
        self.store
            .append(SnapshotRecord {
                snapshot_id: manifest.metadata.snapshot_id,
                created_at: manifest.metadata.created_at,
                created_by: manifest.metadata.created_by.clone(),
                message: manifest.metadata.message.clone(),
                previous: manifest.metadata.previous,
            })
            .await?;

        // The manifest swap is the commit point.
        self.io
            .write_atomic(&self.layout.cache_manifest(), &manifest.to_json_vec()?)
            .await?;
        info!(tx = %tx.id, snapshot = %manifest.metadata.snapshot_id, "remote commit complete");

        // Staging leftovers are cleanup, not commit.
        if let Err(error) = self.io.remove_dir_all(&tx.staging_dir).await {
            warn!(staging = %tx.staging_dir.display(), %error, "deferring staging cleanup");
            self.deferred
                .push(format!("remove {}", tx.staging_dir.display()));
        }
        Ok(())
    }

    async fn rollback(&mut self, tx_id: &TxId) -> Result<(), RemoteFsError> {
        let tx = self.tx.take().ok_or(RemoteFsError::NoTransaction)?;
        if tx.id != *tx_id {
            warn!(began = %tx.id, asked = %tx_id, "rolling back under mismatched id");
        }
        self.io.remove_dir_all(&tx.staging_dir).await?;
        info!(tx = %tx.id, "remote transaction rolled back");
        Ok(())
    }

    fn deferred_cleanups(&self) -> &[String] {
        &self.deferred
    }
}

#[cfg(test)]
mod unittests {
    use chrono::DateTime;
    use strata_core::{Entry, Manifest};
    use strata_utils_hash::Sha256;
    use tempfile::TempDir;

    use super::*;

    fn file_entry(content: &str) -> Entry {
        Entry::File {
            hash: Some(Sha256::digest(content)),
            size: content.len() as u64,
            mtime: DateTime::parse_from_rfc3339("2025-05-30T09:00:00-07:00").unwrap(),
            user: "alice@example.org".into(),
        }
    }

    fn manifest_file(id: &str, previous: Option<&str>, entries: &[(&str, &str)]) -> ManifestFile {
        ManifestFile::seal(
            Manifest::from_entries(
                entries
                    .iter()
                    .map(|(p, c)| (p.parse().unwrap(), file_entry(c))),
            ),
            id.parse().unwrap(),
            previous.map(|p| p.parse().unwrap()),
            DateTime::parse_from_rfc3339("2025-06-01T12:00:00-07:00").unwrap(),
            "alice@example.org",
            None,
        )
        .unwrap()
    }

    fn local_handle(dir: &TempDir, name: &str, content: &str) -> TempHandle {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        TempHandle::new(TempLocation::Local(path))
    }

    #[tokio::test]
    async fn begin_stage_commit_promotes_content_and_manifest() {
        let remote_dir = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let mut remote = StagedRemote::new(RemoteIo::Local, remote_dir.path());
        let tx = TxId::from_string("abc12345".into());

        remote.begin(&tx).await.unwrap();
        let path: RepoPath = "task1/a.txt".parse().unwrap();
        remote
            .stage(&path, local_handle(&temp, "t1", "A"))
            .await
            .unwrap();

        // Nothing visible before commit.
        assert!(!remote_dir.path().join("task1/a.txt").exists());
        assert!(remote.load_manifest().await.unwrap().is_none());

        let manifest = manifest_file("s1", None, &[("task1/a.txt", "A")]);
        remote.stage_manifest(&manifest).await.unwrap();
        remote.commit(&tx).await.unwrap();

        assert_eq!(
            std::fs::read(remote_dir.path().join("task1/a.txt")).unwrap(),
            b"A"
        );
        let live = remote.load_manifest().await.unwrap().unwrap();
        assert_eq!(live, manifest);
        // Log and archive were written.
        let head = remote.store().head().await.unwrap().unwrap();
        assert_eq!(head.snapshot_id.to_string(), "s1");
        assert!(remote_dir.path().join(".dsg/archive/s1.json").exists());
        // Staging is gone.
        assert!(!remote_dir.path().join(".dsg/staging-abc12345").exists());
        assert!(remote.deferred_cleanups().is_empty());
    }

    #[tokio::test]
    async fn rollback_discards_staging() {
        let remote_dir = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let mut remote = StagedRemote::new(RemoteIo::Local, remote_dir.path());
        let tx = TxId::from_string("dead0000".into());

        remote.begin(&tx).await.unwrap();
        let path: RepoPath = "a.txt".parse().unwrap();
        remote
            .stage(&path, local_handle(&temp, "t1", "A"))
            .await
            .unwrap();
        remote.rollback(&tx).await.unwrap();

        assert!(!remote_dir.path().join("a.txt").exists());
        assert!(!remote_dir.path().join(".dsg/staging-dead0000").exists());
    }

    #[tokio::test]
    async fn staged_delete_applies_at_commit() {
        let remote_dir = TempDir::new().unwrap();
        let mut remote = StagedRemote::new(RemoteIo::Local, remote_dir.path());

        // Seed a live repository at s1.
        let tx1 = TxId::from_string("11111111".into());
        let temp = TempDir::new().unwrap();
        remote.begin(&tx1).await.unwrap();
        let gone: RepoPath = "gone.txt".parse().unwrap();
        remote
            .stage(&gone, local_handle(&temp, "t1", "G"))
            .await
            .unwrap();
        remote
            .stage_manifest(&manifest_file("s1", None, &[("gone.txt", "G")]))
            .await
            .unwrap();
        remote.commit(&tx1).await.unwrap();
        assert!(remote_dir.path().join("gone.txt").exists());

        // s2 deletes it.
        let tx2 = TxId::from_string("22222222".into());
        remote.begin(&tx2).await.unwrap();
        remote.stage_delete(&gone).await.unwrap();
        remote
            .stage_manifest(&manifest_file("s2", Some("s1"), &[]))
            .await
            .unwrap();
        remote.commit(&tx2).await.unwrap();

        assert!(!remote_dir.path().join("gone.txt").exists());
        assert_eq!(
            remote
                .store()
                .head()
                .await
                .unwrap()
                .unwrap()
                .snapshot_id
                .to_string(),
            "s2"
        );
    }

    #[tokio::test]
    async fn symlink_staged_from_entry() {
        let remote_dir = TempDir::new().unwrap();
        let mut remote = StagedRemote::new(RemoteIo::Local, remote_dir.path());
        let tx = TxId::from_string("33333333".into());

        remote.begin(&tx).await.unwrap();
        let link: RepoPath = "link".parse().unwrap();
        remote.stage_symlink(&link, "a.txt").await.unwrap();

        let mut manifest = manifest_file("s1", None, &[]);
        manifest.entries.insert(
            link.clone(),
            Entry::Link {
                target: "a.txt".into(),
            },
        );
        let manifest = ManifestFile::seal(
            manifest.entries,
            "s1".parse().unwrap(),
            None,
            DateTime::parse_from_rfc3339("2025-06-01T12:00:00-07:00").unwrap(),
            "alice@example.org",
            None,
        )
        .unwrap();
        remote.stage_manifest(&manifest).await.unwrap();
        remote.commit(&tx).await.unwrap();

        let meta = std::fs::symlink_metadata(remote_dir.path().join("link")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(remote_dir.path().join("link")).unwrap(),
            std::path::Path::new("a.txt")
        );
    }

    #[tokio::test]
    async fn read_streams_live_tree_only() {
        let remote_dir = TempDir::new().unwrap();
        std::fs::write(remote_dir.path().join("live.txt"), "L").unwrap();
        let remote = StagedRemote::new(RemoteIo::Local, remote_dir.path());

        let path: RepoPath = "live.txt".parse().unwrap();
        let mut stream = remote.read(&path).await.unwrap();
        let mut out = Vec::new();
        tokio::io::copy(&mut stream, &mut out).await.unwrap();
        assert_eq!(out, b"L");

        let missing: RepoPath = "missing.txt".parse().unwrap();
        assert!(matches!(
            remote.read(&missing).await,
            Err(RemoteFsError::NotFound { .. })
        ));
    }
}
