//! The engine's error surface.
//!
//! Every fatal error maps onto one stable [`ErrorKind`] plus a human
//! string; recoverable conditions (per-path validation problems, deferred
//! cleanups) travel inside reports instead.

use derive_more::Display;
use thiserror::Error;

use strata_core::{ManifestError, RepoPath};
use strata_scan::{Diagnostic, ScanError};
use strata_store::{LockError, StoreError};
use strata_transaction::{ClientFsError, TransactionError};
use strata_transport::TransportError;

/// Stable error taxonomy, independent of message wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    #[display("validation")]
    Validation,
    #[display("conflict")]
    Conflict,
    #[display("lock_contended")]
    LockContended,
    #[display("lock_stale_reclaim_failed")]
    LockStaleReclaimFailed,
    #[display("transport")]
    Transport,
    #[display("remote_commit")]
    RemoteCommit,
    #[display("client_commit")]
    ClientCommit,
    #[display("consistency")]
    Consistency,
    #[display("corrupted_manifest")]
    CorruptedManifest,
    #[display("config")]
    Config,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{} paths failed validation (first: {})", diagnostics.len(), first(diagnostics))]
    Validation { diagnostics: Vec<Diagnostic> },

    #[error("sync blocked by conflicts: {}", paths.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "))]
    Conflict { paths: Vec<RepoPath> },

    #[error("could not acquire the repository lock within {timeout_secs}s")]
    LockTimeout { timeout_secs: u64 },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Client(#[from] ClientFsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("working directory is already initialized")]
    AlreadyInitialized,

    #[error("remote already contains snapshots; clone instead of init")]
    RemoteNotEmpty,

    #[error("remote has no snapshots yet")]
    RemoteEmpty,
}

impl EngineError {
    /// The stable kind for user-facing dispatch.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::LockTimeout { .. } => ErrorKind::LockContended,
            EngineError::Lock(LockError::Contended { .. }) => ErrorKind::LockContended,
            EngineError::Lock(LockError::StaleReclaimFailed) => ErrorKind::LockStaleReclaimFailed,
            EngineError::Lock(_) => ErrorKind::Consistency,
            EngineError::Scan(_) => ErrorKind::Validation,
            EngineError::Store(StoreError::Corrupted { .. }) => ErrorKind::CorruptedManifest,
            EngineError::Store(_) => ErrorKind::Consistency,
            EngineError::Transaction(TransactionError::Conflicts { .. }) => ErrorKind::Conflict,
            EngineError::Transaction(TransactionError::RemoteCommit(_)) => ErrorKind::RemoteCommit,
            EngineError::Transaction(TransactionError::ClientCommit { .. }) => {
                ErrorKind::ClientCommit
            }
            EngineError::Transaction(TransactionError::Manifest(_)) => {
                ErrorKind::CorruptedManifest
            }
            EngineError::Transaction(_) => ErrorKind::Transport,
            EngineError::Client(ClientFsError::Manifest(_)) => ErrorKind::CorruptedManifest,
            EngineError::Client(ClientFsError::MarkerCorrupted(_)) => ErrorKind::Consistency,
            EngineError::Client(_) => ErrorKind::Consistency,
            EngineError::Transport(_) => ErrorKind::Transport,
            EngineError::Manifest(_) => ErrorKind::CorruptedManifest,
            EngineError::Io { .. } => ErrorKind::Transport,
            EngineError::Toml(_) => ErrorKind::Config,
            EngineError::AlreadyInitialized
            | EngineError::RemoteNotEmpty
            | EngineError::RemoteEmpty => ErrorKind::Validation,
        }
    }
}

fn first(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(|d| format!("{}: {:?}", d.path, d.kind))
        .unwrap_or_default()
}

pub(crate) trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| EngineError::Io {
            context: f(),
            source,
        })
    }
}
