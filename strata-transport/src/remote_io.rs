//! File primitives on either side of the transport.
//!
//! The distributed lock, the snapshot store, and the staged remote backend
//! all need the same handful of operations - read, atomic replace,
//! create-exclusive, rename, remove - against a repository root that is
//! either a local path or a directory on an `ssh`-reachable host. This
//! module provides both flavors behind one value type.
//!
//! Remote paths are passed to `sh` on the far host and must be valid UTF-8.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::TransportError;

/// Where (and how) primitive file operations execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteIo {
    /// Direct filesystem access on this host.
    Local,
    /// Operations executed on `host` via `ssh`.
    Ssh { host: String },
}

impl RemoteIo {
    /// Read a file, `None` if it does not exist.
    pub async fn read_opt(&self, path: &Path) -> Result<Option<Vec<u8>>, TransportError> {
        match self {
            RemoteIo::Local => match tokio::fs::read(path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(TransportError::io(format!("reading {}", path.display()), e)),
            },
            RemoteIo::Ssh { host } => {
                if !self.exists(path).await? {
                    return Ok(None);
                }
                let out = ssh_run(host, &format!("cat {}", quote(path)), None).await?;
                Ok(Some(out))
            }
        }
    }

    /// Read a file that must exist.
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        self.read_opt(path).await?.ok_or_else(|| {
            TransportError::io(
                format!("reading {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )
        })
    }

    /// Write via a sibling temp name and rename into place, so readers see
    /// either the old or the new content, never a torn write.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => {
                let new = sibling(path, ".new");
                let mut file = tokio::fs::File::create(&new)
                    .await
                    .map_err(|e| TransportError::io(format!("creating {}", new.display()), e))?;
                file.write_all(bytes)
                    .await
                    .map_err(|e| TransportError::io(format!("writing {}", new.display()), e))?;
                file.sync_all()
                    .await
                    .map_err(|e| TransportError::io(format!("syncing {}", new.display()), e))?;
                drop(file);
                tokio::fs::rename(&new, path).await.map_err(|e| {
                    TransportError::io(format!("renaming {} into place", new.display()), e)
                })
            }
            RemoteIo::Ssh { host } => {
                let new = sibling(path, ".new");
                let script = format!("cat > {new} && mv -f {new} {path}",
                    new = quote(&new),
                    path = quote(path),
                );
                ssh_run(host, &script, Some(bytes)).await?;
                Ok(())
            }
        }
    }

    /// Create-exclusive write. `Ok(true)` if this call created the file,
    /// `Ok(false)` if it already existed.
    pub async fn write_new(&self, path: &Path, bytes: &[u8]) -> Result<bool, TransportError> {
        match self {
            RemoteIo::Local => {
                let mut file = match tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await
                {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
                    Err(e) => {
                        return Err(TransportError::io(
                            format!("creating {}", path.display()),
                            e,
                        ));
                    }
                };
                file.write_all(bytes)
                    .await
                    .map_err(|e| TransportError::io(format!("writing {}", path.display()), e))?;
                file.sync_all()
                    .await
                    .map_err(|e| TransportError::io(format!("syncing {}", path.display()), e))?;
                Ok(true)
            }
            RemoteIo::Ssh { host } => {
                // noclobber redirection fails when the target exists.
                let script = format!("set -C; cat > {}", quote(path));
                match ssh_run(host, &script, Some(bytes)).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        if self.exists(path).await? {
                            Ok(false)
                        } else {
                            Err(e)
                        }
                    }
                }
            }
        }
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => tokio::fs::rename(from, to).await.map_err(|e| {
                TransportError::io(
                    format!("renaming {} to {}", from.display(), to.display()),
                    e,
                )
            }),
            RemoteIo::Ssh { host } => {
                ssh_run(host, &format!("mv -f {} {}", quote(from), quote(to)), None).await?;
                Ok(())
            }
        }
    }

    /// Remove a file; succeeding when it is already gone.
    pub async fn remove_file(&self, path: &Path) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(TransportError::io(
                    format!("removing {}", path.display()),
                    e,
                )),
            },
            RemoteIo::Ssh { host } => {
                ssh_run(host, &format!("rm -f {}", quote(path)), None).await?;
                Ok(())
            }
        }
    }

    pub async fn remove_dir_all(&self, path: &Path) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(TransportError::io(
                    format!("removing {}", path.display()),
                    e,
                )),
            },
            RemoteIo::Ssh { host } => {
                ssh_run(host, &format!("rm -rf {}", quote(path)), None).await?;
                Ok(())
            }
        }
    }

    pub async fn mkdirp(&self, path: &Path) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => tokio::fs::create_dir_all(path).await.map_err(|e| {
                TransportError::io(format!("creating directory {}", path.display()), e)
            }),
            RemoteIo::Ssh { host } => {
                ssh_run(host, &format!("mkdir -p {}", quote(path)), None).await?;
                Ok(())
            }
        }
    }

    /// Create (or replace) a symlink at `path` pointing at `target`.
    pub async fn symlink(&self, target: &str, path: &Path) -> Result<(), TransportError> {
        match self {
            RemoteIo::Local => {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(TransportError::io(
                            format!("replacing {}", path.display()),
                            e,
                        ));
                    }
                }
                tokio::fs::symlink(target, path).await.map_err(|e| {
                    TransportError::io(format!("creating symlink {}", path.display()), e)
                })
            }
            RemoteIo::Ssh { host } => {
                let script = format!("ln -sfn {} {}", shell_quote(target), quote(path));
                ssh_run(host, &script, None).await?;
                Ok(())
            }
        }
    }

    /// Open a file as a byte stream. For the `ssh` flavor this spawns
    /// `cat` on the far host and hands back its stdout.
    pub async fn open_stream(
        &self,
        path: &Path,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, TransportError> {
        match self {
            RemoteIo::Local => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| TransportError::io(format!("opening {}", path.display()), e))?;
                Ok(Box::new(file))
            }
            RemoteIo::Ssh { host } => {
                let mut child = Command::new("ssh")
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(host)
                    .arg(format!("cat {}", quote(path)))
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| TransportError::io(format!("spawning ssh {host}"), e))?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    TransportError::io(
                        "opening ssh stdout",
                        std::io::Error::other("stdout not piped"),
                    )
                })?;
                // Reap the child once the stream is drained.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(Box::new(stdout))
            }
        }
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, TransportError> {
        match self {
            RemoteIo::Local => Ok(tokio::fs::try_exists(path).await.unwrap_or(false)),
            RemoteIo::Ssh { host } => {
                let status = ssh_status(host, &format!("test -e {}", quote(path))).await?;
                Ok(status)
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

/// Single-quote for `sh` on the far host.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

/// Run `script` under `sh` on `host`, feeding `stdin` if given; returns
/// stdout. Non-zero exit is an error carrying stderr.
pub(crate) async fn ssh_run(
    host: &str,
    script: &str,
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>, TransportError> {
    debug!(host, script, "ssh");
    let mut command = Command::new("ssh");
    command
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(host)
        .arg(script)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| TransportError::io(format!("spawning ssh {host}"), e))?;

    if let Some(bytes) = stdin {
        let mut pipe = child.stdin.take().ok_or_else(|| {
            TransportError::io(
                "opening ssh stdin",
                std::io::Error::other("stdin not piped"),
            )
        })?;
        pipe.write_all(bytes)
            .await
            .map_err(|e| TransportError::io("writing ssh stdin", e))?;
        pipe.shutdown()
            .await
            .map_err(|e| TransportError::io("closing ssh stdin", e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| TransportError::io(format!("waiting for ssh {host}"), e))?;
    if !output.status.success() {
        return Err(TransportError::Command {
            program: format!("ssh {host} {script}"),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

/// Run `script` on `host`, reporting only whether it exited zero.
async fn ssh_status(host: &str, script: &str) -> Result<bool, TransportError> {
    match ssh_run(host, script, None).await {
        Ok(_) => Ok(true),
        Err(TransportError::Command { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
