//! Storage resource handles.

use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

/// Partition mappings of a disk image exposed as host block devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    /// Image the mappings were created for
    pub source: PathBuf,
    /// Partition device nodes, in the order the mapping tool reported them.
    /// Never empty.
    partitions: Vec<PathBuf>,
    /// Whether the mappings are still registered with the OS
    pub active: bool,
}

impl MappedDevice {
    /// Create an active mapping handle.
    ///
    /// At least one partition is required; an image without partitions has
    /// nothing to mount.
    pub fn new(source: impl Into<PathBuf>, partitions: Vec<PathBuf>) -> Result<Self> {
        let source = source.into();
        if partitions.is_empty() {
            return Err(ProvisionError::ResourceNotFound(format!(
                "no partitions mapped for {}",
                source.display()
            )));
        }
        Ok(Self {
            source,
            partitions,
            active: true,
        })
    }

    /// Primary partition: the first mapping reported.
    pub fn primary(&self) -> &Path {
        // `new` rejects an empty list and the field is private.
        self.partitions.first().map(PathBuf::as_path).unwrap_or(&self.source)
    }

    /// All mapped partitions, primary first.
    pub fn partitions(&self) -> &[PathBuf] {
        &self.partitions
    }

    /// Fail unless the mapping is still registered.
    pub fn ensure_active(&self) -> Result<()> {
        if !self.active {
            return Err(ProvisionError::InvalidState(format!(
                "{} is not mapped",
                self.source.display()
            )));
        }
        Ok(())
    }
}

/// A mounted partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMount {
    /// Block device backing the mount
    pub device: PathBuf,
    /// Mount point
    pub mount_path: PathBuf,
    /// Whether the filesystem is still mounted
    pub active: bool,
}

impl ActiveMount {
    pub fn new(device: impl Into<PathBuf>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            mount_path: mount_path.into(),
            active: true,
        }
    }

    /// Fail unless the filesystem is still mounted.
    pub fn ensure_active(&self) -> Result<()> {
        if !self.active {
            return Err(ProvisionError::InvalidState(format!(
                "{} is not mounted",
                self.mount_path.display()
            )));
        }
        Ok(())
    }
}
