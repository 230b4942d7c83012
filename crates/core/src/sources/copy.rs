//! Recursive directory copy
//!
//! Mode-preserving copy used to move fetched sources into the per-config
//! staging area. Cancellation is honored before each file is opened. The
//! source tree must be stable for the duration of one copy; distinct
//! (src, dst) pairs may run concurrently.

use crate::errors::{Result, WarpgateError};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Recursively copy `src` into `dst`, creating `dst` as needed.
///
/// A missing `src` is an error; an empty `src` produces an empty `dst`.
pub async fn copy_dir(src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<()> {
    let metadata = tokio::fs::metadata(src).await.map_err(|e| {
        WarpgateError::Io {
            source: std::io::Error::new(
                e.kind(),
                format!("copy source {} unreadable: {e}", src.display()),
            ),
        }
    })?;
    if !metadata.is_dir() {
        return Err(WarpgateError::configuration(format!(
            "copy source {} is not a directory",
            src.display()
        )));
    }

    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((src_dir, dst_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&dst_dir).await?;

        let mut entries = tokio::fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst_dir.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                if cancel.is_cancelled() {
                    return Err(WarpgateError::Cancelled);
                }
                // tokio::fs::copy preserves permission bits.
                tokio::fs::copy(entry.path(), &target).await?;
            }
            // Sockets, fifos, and dangling symlinks are skipped; cloned
            // repositories do not contain anything a build context needs
            // from them.
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn copies_nested_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("top.txt"), "top").unwrap();
        fs::write(src.path().join("a/b/deep.txt"), "deep").unwrap();

        let cancel = CancellationToken::new();
        let target = dst.path().join("out");
        copy_dir(src.path(), &target, &cancel).await.unwrap();

        assert_eq!(fs::read_to_string(target.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(target.join("a/b/deep.txt")).unwrap(),
            "deep"
        );
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let dst = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result = copy_dir(
            Path::new("/nonexistent/source"),
            &dst.path().join("out"),
            &cancel,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_source_creates_destination() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let target = dst.path().join("out");
        copy_dir(src.path(), &target, &cancel).await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn cancelled_before_file_open() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("f.txt"), "x").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = copy_dir(src.path(), &dst.path().join("out"), &cancel).await;
        assert!(matches!(result, Err(WarpgateError::Cancelled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn preserves_mode_bits() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let cancel = CancellationToken::new();
        let target = dst.path().join("out");
        copy_dir(src.path(), &target, &cancel).await.unwrap();

        let mode = fs::metadata(target.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
