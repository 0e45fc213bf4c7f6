//! Mock backends for testing and development.
//!
//! These simulate the hypervisor manager, the partition mapper and the mount
//! tools in memory. Useful for:
//! - Unit and integration testing of the workflow
//! - Development without root, kpartx or libvirt
//! - Failure injection at every stage

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, instrument};

use crate::descriptor::DomainDescriptor;
use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use crate::storage::{
    require_directory, require_regular_file, ActiveMount, BlockDeviceMapper, FilesystemMounter,
    MappedDevice,
};
use crate::traits::HypervisorClient;

/// Shared, ordered record of mock operations.
pub type MockJournal = Arc<Mutex<Vec<String>>>;

fn poisoned<T>(_: T) -> ProvisionError {
    ProvisionError::InvalidState("Lock poisoned".to_string())
}

fn record(journal: &Option<MockJournal>, entry: String) {
    if let Some(journal) = journal {
        if let Ok(mut entries) = journal.lock() {
            entries.push(entry);
        }
    }
}

// =============================================================================
// Hypervisor
// =============================================================================

/// In-memory hypervisor manager.
pub struct MockHypervisor {
    instances: RwLock<Vec<String>>,
    unavailable: AtomicBool,
    reject_next: Mutex<Option<String>>,
    list_calls: AtomicUsize,
}

impl MockHypervisor {
    /// Create a mock with no instances.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            instances: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            reject_next: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock that already knows the given instance names.
    pub fn with_instances<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        if let Ok(mut instances) = mock.instances.write() {
            instances.extend(names.into_iter().map(Into::into));
        }
        mock
    }

    /// Simulate an outage of the manager.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Refuse the next registration with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.reject_next.lock() {
            *slot = Some(reason.into());
        }
    }

    /// Names of all known instances.
    pub fn instances(&self) -> Vec<String> {
        self.instances.read().map(|i| i.clone()).unwrap_or_default()
    }

    /// Number of listing queries served.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorClient for MockHypervisor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_instances(&self, _ctx: &PrivilegedContext) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProvisionError::UpstreamUnavailable(
                "mock hypervisor is offline".to_string(),
            ));
        }
        Ok(self.instances())
    }

    #[instrument(skip(self, ctx), fields(descriptor = %descriptor_path.display()))]
    async fn create_from_descriptor(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
    ) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProvisionError::UpstreamUnavailable(
                "mock hypervisor is offline".to_string(),
            ));
        }
        if let Some(reason) = self.reject_next.lock().map_err(poisoned)?.take() {
            return Err(ProvisionError::UpstreamRejected(reason));
        }

        let descriptor = DomainDescriptor::load(ctx, descriptor_path)
            .await
            .map_err(|e| ProvisionError::UpstreamRejected(format!("invalid descriptor: {}", e)))?;

        let mut instances = self.instances.write().map_err(poisoned)?;
        if instances.contains(&descriptor.name) {
            return Err(ProvisionError::UpstreamRejected(format!(
                "domain '{}' already exists",
                descriptor.name
            )));
        }
        instances.push(descriptor.name.clone());

        info!(instance = %descriptor.name, "Mock instance started");
        Ok(())
    }
}

// =============================================================================
// Block device mapper
// =============================================================================

/// In-memory partition mapper.
#[derive(Default)]
pub struct MockDeviceMapper {
    mapped: Mutex<HashSet<PathBuf>>,
    fail_map: AtomicBool,
    fail_unmap: AtomicBool,
    next_id: AtomicUsize,
    journal: Option<MockJournal>,
}

impl MockDeviceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record operations into a shared journal.
    pub fn with_journal(mut self, journal: MockJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Make `map` fail.
    pub fn fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    /// Make `unmap` fail.
    pub fn fail_unmap(&self, fail: bool) {
        self.fail_unmap.store(fail, Ordering::SeqCst);
    }

    /// Images with an active mapping.
    pub fn active_mappings(&self) -> Vec<PathBuf> {
        self.mapped
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockDeviceMapper for MockDeviceMapper {
    async fn map(&self, _ctx: &PrivilegedContext, image: &Path) -> Result<MappedDevice> {
        require_regular_file(image).await?;

        if self.fail_map.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                command: "kpartx".to_string(),
                stderr: "mock map failure".to_string(),
            });
        }

        let mut mapped = self.mapped.lock().map_err(poisoned)?;
        if mapped.contains(image) {
            return Err(ProvisionError::InvalidState(format!(
                "{} is already mapped",
                image.display()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let device = MappedDevice::new(
            image,
            vec![
                PathBuf::from(format!("/dev/mapper/mock{}p1", id)),
                PathBuf::from(format!("/dev/mapper/mock{}p2", id)),
            ],
        )?;
        mapped.insert(image.to_path_buf());
        record(&self.journal, format!("map {}", image.display()));
        Ok(device)
    }

    async fn unmap(&self, _ctx: &PrivilegedContext, device: &mut MappedDevice) -> Result<()> {
        device.ensure_active()?;

        if self.fail_unmap.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                command: "kpartx".to_string(),
                stderr: "mock unmap failure".to_string(),
            });
        }

        self.mapped.lock().map_err(poisoned)?.remove(&device.source);
        device.active = false;
        record(&self.journal, format!("unmap {}", device.source.display()));
        Ok(())
    }
}

// =============================================================================
// Mounter
// =============================================================================

/// In-memory mounter. The mount path itself is treated as the guest root.
#[derive(Default)]
pub struct MockMounter {
    mounts: Mutex<HashSet<PathBuf>>,
    fail_mount: AtomicBool,
    fail_unmount: AtomicBool,
    journal: Option<MockJournal>,
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record operations into a shared journal.
    pub fn with_journal(mut self, journal: MockJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Make `mount` fail.
    pub fn fail_mount(&self, fail: bool) {
        self.fail_mount.store(fail, Ordering::SeqCst);
    }

    /// Make `unmount` fail.
    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Paths with an active mount.
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.mounts
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FilesystemMounter for MockMounter {
    async fn mount(
        &self,
        _ctx: &PrivilegedContext,
        device: &MappedDevice,
        mount_path: &Path,
    ) -> Result<ActiveMount> {
        device.ensure_active()?;
        require_directory(mount_path).await?;

        let mut mounts = self.mounts.lock().map_err(poisoned)?;
        if mounts.contains(mount_path) {
            return Err(ProvisionError::InvalidState(format!(
                "{} already has an active mount",
                mount_path.display()
            )));
        }
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                command: "mount".to_string(),
                stderr: "mock mount failure".to_string(),
            });
        }

        mounts.insert(mount_path.to_path_buf());
        record(&self.journal, format!("mount {}", mount_path.display()));
        Ok(ActiveMount::new(device.primary(), mount_path))
    }

    async fn unmount(&self, _ctx: &PrivilegedContext, mount: &mut ActiveMount) -> Result<()> {
        mount.ensure_active()?;

        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                command: "umount".to_string(),
                stderr: "mock unmount failure".to_string(),
            });
        }

        self.mounts.lock().map_err(poisoned)?.remove(&mount.mount_path);
        mount.active = false;
        record(&self.journal, format!("unmount {}", mount.mount_path.display()));
        Ok(())
    }
}
