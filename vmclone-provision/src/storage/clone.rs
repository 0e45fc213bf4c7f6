//! Disk image cloning.
//!
//! Uses `cp --reflink=auto`, which shares blocks with the source on
//! filesystems that support it (btrfs, XFS with reflink) and falls back to a
//! full byte copy everywhere else.

use std::ffi::OsStr;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use super::kpartx::require_regular_file;
use super::mount::require_directory;

/// Produces independent copies of disk images and descriptor templates.
pub struct DiskCloner {
    cp_path: String,
}

impl DiskCloner {
    pub fn new() -> Self {
        Self {
            cp_path: "cp".to_string(),
        }
    }

    /// Set the cp binary path.
    pub fn with_cp(mut self, path: impl Into<String>) -> Self {
        self.cp_path = path.into();
        self
    }

    /// Copy `src` to the fresh path `dest`.
    ///
    /// `dest` must not exist yet and its parent directory must. On return the
    /// copy is a readable regular file of the same size as the source.
    #[instrument(skip(self, ctx), fields(src = %src.display(), dest = %dest.display()))]
    pub async fn clone(&self, ctx: &PrivilegedContext, src: &Path, dest: &Path) -> Result<()> {
        require_regular_file(src).await?;

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        require_directory(parent).await?;

        if tokio::fs::symlink_metadata(dest).await.is_ok() {
            return Err(ProvisionError::InvalidState(format!(
                "{} already exists",
                dest.display()
            )));
        }

        info!("Cloning file");

        let copied = ctx
            .run(
                &self.cp_path,
                [
                    OsStr::new("--reflink=auto"),
                    OsStr::new("--sparse=auto"),
                    OsStr::new("--"),
                    src.as_os_str(),
                    dest.as_os_str(),
                ],
            )
            .await;

        if let Err(e) = copied {
            if tokio::fs::symlink_metadata(dest).await.is_ok() {
                if let Err(rm) = ctx.remove_file(dest).await {
                    warn!(error = %rm, "Failed to remove partial copy");
                }
            }
            return Err(ProvisionError::CloneIncomplete(format!(
                "copy to {} failed: {}",
                dest.display(),
                e
            )));
        }

        if let Err(e) = verify_clone(ctx, src, dest).await {
            if let Err(rm) = ctx.remove_file(dest).await {
                warn!(error = %rm, "Failed to remove incomplete copy");
            }
            return Err(e);
        }

        info!("Clone complete");
        Ok(())
    }
}

impl Default for DiskCloner {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `dest` is a complete, readable copy of `src`.
async fn verify_clone(ctx: &PrivilegedContext, src: &Path, dest: &Path) -> Result<()> {
    let incomplete =
        |reason: String| ProvisionError::CloneIncomplete(format!("{}: {}", dest.display(), reason));

    let src_len = tokio::fs::metadata(src)
        .await
        .map_err(|e| ProvisionError::io(src, e))?
        .len();

    let meta = tokio::fs::metadata(dest)
        .await
        .map_err(|e| incomplete(e.to_string()))?;

    if !meta.is_file() {
        return Err(incomplete("not a regular file".to_string()));
    }
    if meta.len() != src_len {
        return Err(incomplete(format!("size {} != source size {}", meta.len(), src_len)));
    }

    ctx.check_readable(dest)
        .await
        .map_err(|e| incomplete(format!("not readable: {}", e)))?;

    Ok(())
}

/// Delete a cloned artifact.
///
/// Refuses empty paths, the root directory and glob characters, and
/// reports a missing file as `ResourceNotFound`.
pub async fn remove_clone(ctx: &PrivilegedContext, path: &Path) -> Result<()> {
    let text = path.to_string_lossy();
    if text.trim().is_empty() || path == Path::new("/") || text.contains('*') {
        return Err(ProvisionError::InvalidArgument(format!(
            "refusing to remove '{}'",
            text
        )));
    }

    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| ProvisionError::io(path, e))?;
    if meta.is_dir() {
        return Err(ProvisionError::InvalidArgument(format!(
            "refusing to remove directory {}",
            path.display()
        )));
    }

    ctx.remove_file(path).await?;
    info!(path = %path.display(), "Removed cloned file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_creates_independent_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        let dest = dir.path().join("web2.img");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        let ctx = PrivilegedContext::unprivileged();
        DiskCloner::new().clone(&ctx, &src, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 4096]);

        // Writing the copy leaves the source untouched.
        std::fs::write(&dest, b"changed").unwrap();
        assert_eq!(std::fs::read(&src).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_clone_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new()
            .clone(&ctx, &dir.path().join("missing.img"), &dir.path().join("web2.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_clone_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        std::fs::write(&src, b"disk").unwrap();

        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new()
            .clone(&ctx, &src, &dir.path().join("nope").join("web2.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_clone_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        let dest = dir.path().join("web2.img");
        std::fs::write(&src, b"disk").unwrap();
        std::fs::write(&dest, b"existing").unwrap();

        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new().clone(&ctx, &src, &dest).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidState(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_failed_copy_is_clone_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        let dest = dir.path().join("web2.img");
        std::fs::write(&src, b"disk").unwrap();

        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new()
            .with_cp("false")
            .clone(&ctx, &src, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CloneIncomplete(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_copy_that_produces_nothing_is_clone_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        std::fs::write(&src, b"disk").unwrap();

        // `true` exits 0 without writing the destination.
        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new()
            .with_cp("true")
            .clone(&ctx, &src, &dir.path().join("web2.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CloneIncomplete(_)));
    }

    #[tokio::test]
    async fn test_truncated_copy_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.img");
        let dest = dir.path().join("web2.img");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        // Stand-in cp that writes a short destination and reports success.
        let cp = dir.path().join("short-cp");
        std::fs::write(&cp, "#!/bin/sh\nfor last; do :; done\nprintf short > \"$last\"\n")
            .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cp, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let ctx = PrivilegedContext::unprivileged();
        let err = DiskCloner::new()
            .with_cp(cp.to_string_lossy())
            .clone(&ctx, &src, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CloneIncomplete(ref m) if m.contains("size 5")));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_remove_clone_guards() {
        let ctx = PrivilegedContext::unprivileged();
        assert!(matches!(
            remove_clone(&ctx, Path::new("/")).await,
            Err(ProvisionError::InvalidArgument(_))
        ));
        assert!(matches!(
            remove_clone(&ctx, Path::new("/var/lib/*")).await,
            Err(ProvisionError::InvalidArgument(_))
        ));
        assert!(matches!(
            remove_clone(&ctx, Path::new("/nonexistent/web2.img")).await,
            Err(ProvisionError::ResourceNotFound(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            remove_clone(&ctx, dir.path()).await,
            Err(ProvisionError::InvalidArgument(_))
        ));

        let file = dir.path().join("web2.img");
        std::fs::write(&file, b"disk").unwrap();
        remove_clone(&ctx, &file).await.unwrap();
        assert!(!file.exists());
    }
}
