//! Filesystem layout
//!
//! Every download owns one directory named after its id under the
//! configured root. The peer client writes into it, the streaming handler
//! reads from it, and cleanup removes it wholesale.

use std::path::{Path, PathBuf};
use tracing::warn;

/// The per-download directory: `{root}/{id}`
pub fn dir_for(root: &Path, id: &str) -> PathBuf {
    root.join(id)
}

/// Recursively enumerate every file under `dir`, depth first.
///
/// Returned paths are absolute whenever `dir` is.
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }

    Ok(files)
}

/// Recursively remove a directory. Errors are logged, never propagated;
/// leftover bytes on disk are not worth failing a download over.
pub async fn remove_dir_logged(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove directory {:?}: {}", dir, err);
        }
    }
}
