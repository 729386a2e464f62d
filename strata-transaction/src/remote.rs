//! The remote filesystem collaborator contract.
//!
//! Two implementations share it: the copy-on-write backend
//! ([`ZfsRemote`](crate::ZfsRemote)) and the staged-directory backend
//! ([`StagedRemote`](crate::StagedRemote)). The coordinator drives either
//! through this trait alone.

use async_trait::async_trait;
use thiserror::Error;

use strata_core::{ManifestError, ManifestFile, RepoPath};
use strata_store::StoreError;
use strata_transport::{ByteStream, TempHandle, TransportError};

use crate::txid::TxId;

#[derive(Error, Debug)]
pub enum RemoteFsError {
    #[error(transparent)]
    Io(#[from] TransportError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("transaction {0} already in progress")]
    TransactionActive(TxId),

    #[error("nothing staged under {path}: handle kind does not match this backend")]
    HandleMismatch { path: RepoPath },

    #[error("remote path {path} does not exist")]
    NotFound { path: RepoPath },

    #[error("no manifest was staged before commit")]
    ManifestNotStaged,
}

/// The remote side of a transaction.
///
/// `begin`/`commit`/`rollback` bracket staged mutations; between them the
/// live tree stays untouched, so readers observe either the old snapshot
/// or, after commit, the new one in its entirety. `commit` also appends
/// the snapshot record to the log and archives the manifest.
#[async_trait]
pub trait RemoteFilesystem: Send {
    /// Open a transaction. Detects init (no repository yet) vs sync.
    async fn begin(&mut self, tx: &TxId) -> Result<(), RemoteFsError>;

    /// Take ownership of a transferred temp file and park it under `path`
    /// in the pending area.
    async fn stage(&mut self, path: &RepoPath, handle: TempHandle) -> Result<(), RemoteFsError>;

    /// Stage a symlink. Links carry no byte stream; they materialize from
    /// their manifest entry.
    async fn stage_symlink(&mut self, path: &RepoPath, target: &str) -> Result<(), RemoteFsError>;

    /// Stage the removal of `path` from the live tree.
    async fn stage_delete(&mut self, path: &RepoPath) -> Result<(), RemoteFsError>;

    /// Stage the new manifest; the manifest swap is the commit point.
    async fn stage_manifest(&mut self, manifest: &ManifestFile) -> Result<(), RemoteFsError>;

    /// Stream a file from the live (pre-transaction) tree.
    async fn read(&self, path: &RepoPath) -> Result<ByteStream, RemoteFsError>;

    /// The live manifest, `None` before the first snapshot.
    async fn load_manifest(&self) -> Result<Option<ManifestFile>, RemoteFsError>;

    /// Atomically promote everything staged. The point of no return.
    async fn commit(&mut self, tx: &TxId) -> Result<(), RemoteFsError>;

    /// Discard everything staged.
    async fn rollback(&mut self, tx: &TxId) -> Result<(), RemoteFsError>;

    /// Cleanups that failed non-fatally during commit, for operators.
    fn deferred_cleanups(&self) -> &[String];
}
