//! Transport for remotes reachable as a filesystem path.
//!
//! Both directions park the stream in one session-scoped temp directory on
//! this host; "remote" staging is just another local rename for the staged
//! backend.

use std::time::Duration;

use tempfile::TempDir;
use tracing::debug;

use strata_core::RepoPath;

use crate::copy::copy_with_inactivity_timeout;
use crate::{ByteStream, TempHandle, TempLocation, Transport, TransportError};

pub struct LocalTransport {
    inactivity_timeout: Duration,
    session: Option<Session>,
}

struct Session {
    dir: TempDir,
    counter: u64,
}

impl LocalTransport {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            inactivity_timeout,
            session: None,
        }
    }

    async fn park(
        &mut self,
        path: &RepoPath,
        mut content: ByteStream,
    ) -> Result<TempHandle, TransportError> {
        let timeout = self.inactivity_timeout;
        let session = self.session.as_mut().ok_or(TransportError::SessionNotOpen)?;
        session.counter += 1;
        let temp_path = session.dir.path().join(format!("t{}", session.counter));

        let mut out = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| TransportError::io(format!("creating {}", temp_path.display()), e))?;
        let copied =
            copy_with_inactivity_timeout(&mut content, &mut out, path.as_str(), timeout).await?;
        out.sync_all()
            .await
            .map_err(|e| TransportError::io(format!("syncing {}", temp_path.display()), e))?;

        debug!(path = %path, bytes = copied, "parked stream");
        Ok(TempHandle::new(TempLocation::Local(temp_path)))
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(crate::DEFAULT_INACTIVITY_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn begin(&mut self) -> Result<(), TransportError> {
        let dir = TempDir::with_prefix("strata-transport-")
            .map_err(|e| TransportError::io("creating transport session dir", e))?;
        self.session = Some(Session { dir, counter: 0 });
        Ok(())
    }

    async fn transfer_to_remote(
        &mut self,
        path: &RepoPath,
        content: ByteStream,
    ) -> Result<TempHandle, TransportError> {
        self.park(path, content).await
    }

    async fn transfer_to_local(
        &mut self,
        path: &RepoPath,
        content: ByteStream,
    ) -> Result<TempHandle, TransportError> {
        self.park(path, content).await
    }

    async fn end(&mut self) -> Result<(), TransportError> {
        // Dropping the TempDir removes anything left unconsumed.
        self.session = None;
        Ok(())
    }
}

#[cfg(test)]
mod unittests {
    use super::*;

    fn stream(bytes: &'static [u8]) -> ByteStream {
        Box::new(bytes)
    }

    #[tokio::test]
    async fn parks_streams_in_session_dir() {
        let mut transport = LocalTransport::default();
        transport.begin().await.unwrap();

        let path: RepoPath = "a.txt".parse().unwrap();
        let handle = transport
            .transfer_to_remote(&path, stream(b"A"))
            .await
            .unwrap();

        match handle.location() {
            TempLocation::Local(temp) => {
                assert_eq!(std::fs::read(temp).unwrap(), b"A");
            }
            other => panic!("expected local handle, got {other:?}"),
        }
        transport.end().await.unwrap();
    }

    #[tokio::test]
    async fn unconsumed_handles_vanish_at_end() {
        let mut transport = LocalTransport::default();
        transport.begin().await.unwrap();

        let path: RepoPath = "a.txt".parse().unwrap();
        let handle = transport
            .transfer_to_local(&path, stream(b"A"))
            .await
            .unwrap();
        let temp = match handle.into_location() {
            TempLocation::Local(temp) => temp,
            other => panic!("expected local handle, got {other:?}"),
        };
        assert!(temp.exists());

        transport.end().await.unwrap();
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn transfer_without_session_fails() {
        let mut transport = LocalTransport::default();
        let path: RepoPath = "a.txt".parse().unwrap();
        let result = transport.transfer_to_remote(&path, stream(b"A")).await;
        assert!(matches!(result, Err(TransportError::SessionNotOpen)));
    }

    #[tokio::test]
    async fn distinct_transfers_get_distinct_handles() {
        let mut transport = LocalTransport::default();
        transport.begin().await.unwrap();

        let path: RepoPath = "a.txt".parse().unwrap();
        let first = transport
            .transfer_to_remote(&path, stream(b"1"))
            .await
            .unwrap();
        let second = transport
            .transfer_to_remote(&path, stream(b"2"))
            .await
            .unwrap();
        assert_ne!(first.location(), second.location());
        transport.end().await.unwrap();
    }
}
