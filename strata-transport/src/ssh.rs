//! SSH transport: streams piped through `ssh`, remote temp storage via
//! `mktemp -d`.

use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use strata_core::RepoPath;

use crate::copy::copy_with_inactivity_timeout;
use crate::remote_io::{shell_quote, ssh_run};
use crate::{ByteStream, TempHandle, TempLocation, Transport, TransportError};

pub struct SshTransport {
    host: String,
    inactivity_timeout: Duration,
    session: Option<SshSession>,
}

struct SshSession {
    local_dir: TempDir,
    remote_dir: String,
    counter: u64,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, inactivity_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            inactivity_timeout,
            session: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait::async_trait]
impl Transport for SshTransport {
    async fn begin(&mut self) -> Result<(), TransportError> {
        let local_dir = TempDir::with_prefix("strata-transport-")
            .map_err(|e| TransportError::io("creating transport session dir", e))?;
        let out = ssh_run(&self.host, "mktemp -d -t strata-XXXXXXXX", None).await?;
        let remote_dir = String::from_utf8_lossy(&out).trim().to_owned();
        if remote_dir.is_empty() {
            return Err(TransportError::Command {
                program: format!("ssh {} mktemp", self.host),
                status: "0".into(),
                stderr: "mktemp returned no path".into(),
            });
        }
        debug!(host = %self.host, remote_dir, "ssh session open");
        self.session = Some(SshSession {
            local_dir,
            remote_dir,
            counter: 0,
        });
        Ok(())
    }

    async fn transfer_to_remote(
        &mut self,
        path: &RepoPath,
        mut content: ByteStream,
    ) -> Result<TempHandle, TransportError> {
        let timeout = self.inactivity_timeout;
        let session = self.session.as_mut().ok_or(TransportError::SessionNotOpen)?;
        session.counter += 1;
        let remote_path = format!("{}/t{}", session.remote_dir, session.counter);

        let script = format!("cat > {}", shell_quote(&remote_path));
        let mut child = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.host)
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::io(format!("spawning ssh {}", self.host), e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            TransportError::io(
                "opening ssh stdin",
                std::io::Error::other("stdin not piped"),
            )
        })?;
        let copied =
            copy_with_inactivity_timeout(&mut content, &mut stdin, path.as_str(), timeout).await?;
        stdin
            .shutdown()
            .await
            .map_err(|e| TransportError::io("closing ssh stdin", e))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransportError::io(format!("waiting for ssh {}", self.host), e))?;
        if !output.status.success() {
            return Err(TransportError::Command {
                program: format!("ssh {} {script}", self.host),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        debug!(path = %path, bytes = copied, remote_path, "streamed to remote");
        Ok(TempHandle::new(TempLocation::Remote(remote_path)))
    }

    async fn transfer_to_local(
        &mut self,
        path: &RepoPath,
        mut content: ByteStream,
    ) -> Result<TempHandle, TransportError> {
        let timeout = self.inactivity_timeout;
        let session = self.session.as_mut().ok_or(TransportError::SessionNotOpen)?;
        session.counter += 1;
        let temp_path = session
            .local_dir
            .path()
            .join(format!("t{}", session.counter));

        let mut out = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| TransportError::io(format!("creating {}", temp_path.display()), e))?;
        let copied =
            copy_with_inactivity_timeout(&mut content, &mut out, path.as_str(), timeout).await?;
        out.sync_all()
            .await
            .map_err(|e| TransportError::io(format!("syncing {}", temp_path.display()), e))?;

        debug!(path = %path, bytes = copied, "streamed to local");
        Ok(TempHandle::new(TempLocation::Local(temp_path)))
    }

    async fn end(&mut self) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            let script = format!("rm -rf {}", shell_quote(&session.remote_dir));
            if let Err(error) = ssh_run(&self.host, &script, None).await {
                // Leftover temp dirs are a nuisance, not a failure.
                warn!(host = %self.host, %error, "failed to remove remote session dir");
            }
        }
        Ok(())
    }
}
