//! Block device and mount traits.

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::privilege::PrivilegedContext;
use super::types::{ActiveMount, MappedDevice};

/// Maps disk images to host block devices.
///
/// Implementations must reject mapping an image that already has an active
/// mapping, and must reject releasing a handle twice.
#[async_trait]
pub trait BlockDeviceMapper: Send + Sync {
    /// Map the partitions of `image` as block devices.
    ///
    /// The image must exist and be a regular file.
    async fn map(&self, ctx: &PrivilegedContext, image: &Path) -> Result<MappedDevice>;

    /// Remove the mappings. The handle is marked inactive on success.
    async fn unmap(&self, ctx: &PrivilegedContext, device: &mut MappedDevice) -> Result<()>;
}

/// Mounts mapped partitions.
///
/// Callers must unmount before unmapping the device behind the mount.
#[async_trait]
pub trait FilesystemMounter: Send + Sync {
    /// Mount the primary partition of `device` at `mount_path`.
    ///
    /// `mount_path` must be an existing directory without an active mount.
    async fn mount(
        &self,
        ctx: &PrivilegedContext,
        device: &MappedDevice,
        mount_path: &Path,
    ) -> Result<ActiveMount>;

    /// Unmount. The handle is marked inactive on success.
    async fn unmount(&self, ctx: &PrivilegedContext, mount: &mut ActiveMount) -> Result<()>;
}
