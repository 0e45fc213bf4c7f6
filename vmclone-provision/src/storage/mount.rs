//! Filesystem mounter using `mount(8)` and `umount(8)`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, instrument};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use super::traits::FilesystemMounter;
use super::types::{ActiveMount, MappedDevice};

/// Mounts partitions by shelling out to the system mount tools.
pub struct CommandMounter {
    mount_path: String,
    umount_path: String,
    mountpoint_path: String,
    /// Mount points held by this process
    active: Mutex<HashSet<PathBuf>>,
}

impl CommandMounter {
    pub fn new() -> Self {
        Self {
            mount_path: "mount".to_string(),
            umount_path: "umount".to_string(),
            mountpoint_path: "mountpoint".to_string(),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Set the mount and umount binary paths.
    pub fn with_tools(mut self, mount: impl Into<String>, umount: impl Into<String>) -> Self {
        self.mount_path = mount.into();
        self.umount_path = umount.into();
        self
    }

    /// Set the mountpoint binary path.
    pub fn with_mountpoint(mut self, path: impl Into<String>) -> Self {
        self.mountpoint_path = path.into();
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashSet<PathBuf>>> {
        self.active
            .lock()
            .map_err(|_| ProvisionError::InvalidState("mount registry lock poisoned".to_string()))
    }

    /// Check if a path is already a mount point.
    async fn is_mounted(&self, ctx: &PrivilegedContext, path: &Path) -> Result<bool> {
        let output = ctx.output(&self.mountpoint_path, [OsStr::new("-q"), path.as_os_str()]).await?;
        Ok(output.status.success())
    }
}

impl Default for CommandMounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail unless `path` is an existing directory.
pub(crate) async fn require_directory(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ProvisionError::io(path, e))?;
    if !meta.is_dir() {
        return Err(ProvisionError::ResourceNotFound(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl FilesystemMounter for CommandMounter {
    #[instrument(
        skip(self, ctx, device),
        fields(device = %device.primary().display(), mount_path = %mount_path.display())
    )]
    async fn mount(
        &self,
        ctx: &PrivilegedContext,
        device: &MappedDevice,
        mount_path: &Path,
    ) -> Result<ActiveMount> {
        device.ensure_active()?;
        require_directory(mount_path).await?;

        let held = self.lock()?.contains(mount_path);
        if held || self.is_mounted(ctx, mount_path).await? {
            return Err(ProvisionError::InvalidState(format!(
                "{} already has an active mount",
                mount_path.display()
            )));
        }

        info!("Mounting guest root filesystem");

        let partition = device.primary();
        ctx.run(&self.mount_path, [partition.as_os_str(), mount_path.as_os_str()])
            .await?;

        self.lock()?.insert(mount_path.to_path_buf());

        info!("Guest filesystem mounted");
        Ok(ActiveMount::new(partition, mount_path))
    }

    #[instrument(skip(self, ctx, mount), fields(mount_path = %mount.mount_path.display()))]
    async fn unmount(&self, ctx: &PrivilegedContext, mount: &mut ActiveMount) -> Result<()> {
        mount.ensure_active()?;

        info!("Unmounting guest filesystem");

        ctx.run(&self.umount_path, [mount.mount_path.as_os_str()]).await?;

        mount.active = false;
        self.lock()?.remove(&mount.mount_path);

        info!("Guest filesystem unmounted");
        Ok(())
    }
}
