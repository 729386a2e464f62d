//! Byte-stream transports and remote IO primitives.
//!
//! A [`Transport`] moves single files as opaque byte streams into session
//! temp storage on either side and hands back [`TempHandle`]s; the
//! filesystem that consumes a handle takes ownership of it at its `stage`
//! call. Two implementations share the contract: [`LocalTransport`] for
//! remotes reachable as a filesystem path, and [`SshTransport`] which pipes
//! streams through `ssh`.
//!
//! [`RemoteIo`] is the lower seam: the small set of file primitives (read,
//! atomic write, create-exclusive, rename, remove) that the distributed
//! lock, the snapshot store, and the staged remote backend all need, in a
//! local and an `ssh`-executed flavor.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;

mod copy;
mod local;
pub mod remote_io;
mod ssh;

pub use copy::copy_with_inactivity_timeout;
pub use local::LocalTransport;
pub use remote_io::RemoteIo;
pub use ssh::SshTransport;

use strata_core::RepoPath;

/// Default transfer inactivity timeout.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer of {path} stalled for more than {timeout:?}")]
    Inactive { path: String, timeout: Duration },

    #[error("transport session is not open")]
    SessionNotOpen,

    #[error("remote command {program:?} failed with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
}

impl TransportError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A single-file byte stream. The engine never interprets contents.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Where a transferred file landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempLocation {
    /// A temp file on this host.
    Local(PathBuf),
    /// A temp file on the transport's remote host, as a path string there.
    Remote(String),
}

/// A transferred file parked in session temp storage.
///
/// Handles are owned by the consuming filesystem from the moment they are
/// passed to a `stage` call; anything left unconsumed is wiped with the
/// session at `end()`.
#[derive(Debug)]
pub struct TempHandle {
    location: TempLocation,
}

impl TempHandle {
    pub fn new(location: TempLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &TempLocation {
        &self.location
    }

    pub fn into_location(self) -> TempLocation {
        self.location
    }
}

/// The abstract byte-stream channel between the client and the remote.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the session: local temp dir, plus a remote temp dir for
    /// transports with a remote side.
    async fn begin(&mut self) -> Result<(), TransportError>;

    /// Stream one file toward the remote side; returns a handle to the
    /// remote temp copy.
    async fn transfer_to_remote(
        &mut self,
        path: &RepoPath,
        content: ByteStream,
    ) -> Result<TempHandle, TransportError>;

    /// Stream one file toward the local side; returns a handle to the
    /// local temp copy.
    async fn transfer_to_local(
        &mut self,
        path: &RepoPath,
        content: ByteStream,
    ) -> Result<TempHandle, TransportError>;

    /// Close the session and discard unconsumed temp files.
    async fn end(&mut self) -> Result<(), TransportError>;
}
