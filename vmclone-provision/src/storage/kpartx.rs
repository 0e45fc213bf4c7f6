//! kpartx-based block device mapper.
//!
//! Attaches the image to a loop device and creates one device-mapper node per
//! partition under `/dev/mapper`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use super::parse::{live_associations, parse_kpartx_add};
use super::traits::BlockDeviceMapper;
use super::types::MappedDevice;

/// Block device mapper driving `kpartx` and `losetup`.
pub struct KpartxMapper {
    kpartx_path: String,
    losetup_path: String,
    /// Images mapped by this process
    mapped: Mutex<HashSet<PathBuf>>,
}

impl KpartxMapper {
    /// Create a mapper using the tools found on `PATH`.
    pub fn new() -> Self {
        Self {
            kpartx_path: "kpartx".to_string(),
            losetup_path: "losetup".to_string(),
            mapped: Mutex::new(HashSet::new()),
        }
    }

    /// Set the kpartx binary path.
    pub fn with_kpartx(mut self, path: impl Into<String>) -> Self {
        self.kpartx_path = path.into();
        self
    }

    /// Set the losetup binary path.
    pub fn with_losetup(mut self, path: impl Into<String>) -> Self {
        self.losetup_path = path.into();
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashSet<PathBuf>>> {
        self.mapped
            .lock()
            .map_err(|_| ProvisionError::InvalidState("mapping registry lock poisoned".to_string()))
    }

    /// Reject images that already have a live loop device attached.
    async fn ensure_not_attached(&self, ctx: &PrivilegedContext, image: &Path) -> Result<()> {
        let held = self.lock()?.contains(image);
        if held {
            return Err(ProvisionError::InvalidState(format!(
                "{} is already mapped",
                image.display()
            )));
        }

        let listing = ctx.run(&self.losetup_path, [OsStr::new("-j"), image.as_os_str()]).await?;
        let live = live_associations(&listing);
        if let Some(existing) = live.first() {
            return Err(ProvisionError::InvalidState(format!(
                "{} is already attached to {}",
                image.display(),
                existing.device.display()
            )));
        }
        Ok(())
    }
}

impl Default for KpartxMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl KpartxMapper {
    /// Best-effort removal of whatever a failed `kpartx -a` left behind.
    async fn release_partial(&self, ctx: &PrivilegedContext, image: &Path) {
        if let Err(e) = ctx.run(&self.kpartx_path, [OsStr::new("-d"), image.as_os_str()]).await {
            warn!(error = %e, "Failed to release partial mapping");
        }
    }
}

/// Fail unless `image` is an existing regular file.
pub(crate) async fn require_regular_file(image: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(image)
        .await
        .map_err(|e| ProvisionError::io(image, e))?;
    if !meta.is_file() {
        return Err(ProvisionError::ResourceNotFound(format!(
            "{} is not a regular file",
            image.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl BlockDeviceMapper for KpartxMapper {
    #[instrument(skip(self, ctx), fields(image = %image.display()))]
    async fn map(&self, ctx: &PrivilegedContext, image: &Path) -> Result<MappedDevice> {
        require_regular_file(image).await?;
        self.ensure_not_attached(ctx, image).await?;

        info!("Mapping disk image partitions");

        let added = ctx
            .run(
                &self.kpartx_path,
                [OsStr::new("-a"), OsStr::new("-v"), OsStr::new("-s"), image.as_os_str()],
            )
            .await;
        let output = match added {
            Ok(output) => output,
            Err(e) => {
                // kpartx may have attached the loop device before failing.
                self.release_partial(ctx, image).await;
                return Err(e);
            }
        };
        debug!(output = %output.trim(), "kpartx output");

        let partitions: Vec<PathBuf> = parse_kpartx_add(&output)
            .into_iter()
            .map(|m| m.device)
            .collect();

        if partitions.is_empty() {
            // Nothing usable was mapped; drop the loop device kpartx may have attached.
            self.release_partial(ctx, image).await;
        }

        let device = MappedDevice::new(image, partitions)?;
        self.lock()?.insert(image.to_path_buf());

        info!(
            primary = %device.primary().display(),
            partitions = device.partitions().len(),
            "Disk image mapped"
        );
        Ok(device)
    }

    #[instrument(skip(self, ctx, device), fields(image = %device.source.display()))]
    async fn unmap(&self, ctx: &PrivilegedContext, device: &mut MappedDevice) -> Result<()> {
        device.ensure_active()?;

        info!("Removing partition mappings");

        ctx.run(
            &self.kpartx_path,
            [OsStr::new("-d"), OsStr::new("-v"), device.source.as_os_str()],
        )
        .await?;

        device.active = false;
        self.lock()?.remove(&device.source);

        info!("Disk image unmapped");
        Ok(())
    }
}
