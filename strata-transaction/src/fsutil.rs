//! Small local filesystem helpers shared by the collaborators.

use std::path::Path;

/// Rename, falling back to copy-and-remove when source and destination sit
/// on different filesystems.
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}
