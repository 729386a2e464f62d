//! Stream copy with an inactivity watchdog.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Copy `reader` to `writer`, failing if no bytes arrive for `timeout`.
///
/// The timeout is per read, not per transfer: a slow but moving stream
/// never trips it. Returns the number of bytes copied.
pub async fn copy_with_inactivity_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    path: &str,
    timeout: Duration,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        let read = tokio::time::timeout(timeout, reader.read(&mut buf))
            .await
            .map_err(|_| TransportError::Inactive {
                path: path.to_owned(),
                timeout,
            })?
            .map_err(|e| TransportError::io(format!("reading {path}"), e))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buf[..read])
            .await
            .map_err(|e| TransportError::io(format!("writing temp copy of {path}"), e))?;
        copied += read as u64;
    }
    writer
        .flush()
        .await
        .map_err(|e| TransportError::io(format!("flushing temp copy of {path}"), e))?;
    Ok(copied)
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[tokio::test]
    async fn copies_everything() {
        let mut reader: &[u8] = b"some file content";
        let mut writer = Vec::new();
        let copied =
            copy_with_inactivity_timeout(&mut reader, &mut writer, "a.txt", Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(copied, 17);
        assert_eq!(writer, b"some file content");
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        // A duplex with nothing written and the writer held open stalls.
        let (client, mut server) = tokio::io::duplex(16);
        let mut reader = client;
        let mut writer = Vec::new();
        let result = copy_with_inactivity_timeout(
            &mut reader,
            &mut writer,
            "a.txt",
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Inactive { .. })));
        // Keep the far end alive until after the timeout fired.
        use tokio::io::AsyncWriteExt as _;
        let _ = server.shutdown().await;
    }
}
