//! Provisioning workflow.
//!
//! Drives one run through the state machine:
//!
//! ```text
//! Init -> Named -> DiskCloned -> Mounted -> IdentitySet -> Unmounted
//!      -> DescriptorCloned -> DescriptorEdited -> Started
//! ```
//!
//! Every resource is recorded in a ledger as soon as it is acquired. When a
//! step fails the run enters `Failed` and the ledger is released in reverse
//! acquisition order: unmount, unmap, remove descriptor, remove disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::descriptor::{DomainDescriptor, DomainDescriptorEditor};
use crate::error::{ProvisionError, Result, WorkflowError};
use crate::identity::IdentityRewriter;
use crate::privilege::PrivilegedContext;
use crate::storage::{
    remove_clone, ActiveMount, BlockDeviceMapper, DiskCloner, FilesystemMounter, MappedDevice,
};
use crate::traits::HypervisorClient;
use crate::types::{InstanceIdentity, InstanceSpec, ProvisionState};

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    /// Name, disk and descriptor of the new instance
    pub identity: InstanceIdentity,
    /// Always `Started`
    pub state: ProvisionState,
    /// Summary of the descriptor handed to the hypervisor
    pub descriptor: DomainDescriptor,
}

/// Resources acquired by the in-flight run.
#[derive(Debug, Default)]
struct Ledger {
    disk: Option<PathBuf>,
    device: Option<MappedDevice>,
    mount: Option<ActiveMount>,
    descriptor: Option<PathBuf>,
}

/// Progress of a single run.
struct Run {
    state: ProvisionState,
    identity: InstanceIdentity,
    ledger: Ledger,
}

impl Run {
    fn new() -> Self {
        Self {
            state: ProvisionState::Init,
            identity: InstanceIdentity {
                name: String::new(),
                disk_path: None,
                descriptor_path: None,
            },
            ledger: Ledger::default(),
        }
    }

    fn advance(&mut self, to: ProvisionState) {
        info!(from = %self.state, to = %to, instance = %self.identity.name, "Stage complete");
        self.state = to;
    }

    /// State the run was trying to enter.
    fn pending(&self) -> ProvisionState {
        self.state.next().unwrap_or(ProvisionState::Failed)
    }
}

/// Clones a base image into a new, running instance.
pub struct ProvisioningWorkflow {
    hypervisor: Arc<dyn HypervisorClient>,
    mapper: Arc<dyn BlockDeviceMapper>,
    mounter: Arc<dyn FilesystemMounter>,
    cloner: DiskCloner,
    editor: DomainDescriptorEditor,
}

impl ProvisioningWorkflow {
    /// Create a workflow over the given backends.
    pub fn new(
        hypervisor: Arc<dyn HypervisorClient>,
        mapper: Arc<dyn BlockDeviceMapper>,
        mounter: Arc<dyn FilesystemMounter>,
    ) -> Self {
        Self {
            hypervisor,
            mapper,
            mounter,
            cloner: DiskCloner::new(),
            editor: DomainDescriptorEditor::new(),
        }
    }

    /// Use a specific cloner (e.g. a custom `cp` path).
    pub fn with_cloner(mut self, cloner: DiskCloner) -> Self {
        self.cloner = cloner;
        self
    }

    /// Provision one instance.
    ///
    /// On failure, every resource acquired so far has been released (or the
    /// release failure is listed in the error) before this returns.
    #[instrument(
        skip(self, ctx, spec),
        fields(prefix = %spec.type_prefix, backend = self.hypervisor.name())
    )]
    pub async fn run(
        &self,
        ctx: &PrivilegedContext,
        spec: &InstanceSpec,
    ) -> std::result::Result<ProvisionOutcome, WorkflowError> {
        let mut run = Run::new();

        match self.execute(ctx, spec, &mut run).await {
            Ok(descriptor) => {
                info!(instance = %run.identity.name, "Instance provisioned");
                Ok(ProvisionOutcome {
                    identity: run.identity,
                    state: run.state,
                    descriptor,
                })
            }
            Err(source) => {
                let stage = run.pending();
                error!(stage = %stage, error = %source, "Provisioning failed, rolling back");
                run.state = ProvisionState::Failed;

                let rollback_failures = self.rollback(ctx, &mut run.ledger).await;
                Err(WorkflowError {
                    stage,
                    source,
                    rollback_failures,
                })
            }
        }
    }

    async fn execute(
        &self,
        ctx: &PrivilegedContext,
        spec: &InstanceSpec,
        run: &mut Run,
    ) -> Result<DomainDescriptor> {
        spec.validate()?;

        // Init -> Named
        let count = self.hypervisor.count_by_prefix(ctx, &spec.type_prefix).await?;
        let identity = InstanceIdentity::from_count(&spec.type_prefix, count);
        self.reserve(ctx, spec, &identity.name).await?;
        run.identity = identity;
        run.advance(ProvisionState::Named);

        // Named -> DiskCloned
        let disk_path = spec.disk_path_for(&run.identity.name);
        self.cloner.clone(ctx, &spec.base_image_path, &disk_path).await?;
        run.ledger.disk = Some(disk_path.clone());
        run.identity.disk_path = Some(disk_path.clone());
        run.advance(ProvisionState::DiskCloned);

        // DiskCloned -> Mounted
        let device = self.mapper.map(ctx, &disk_path).await?;
        let mount = self.mounter.mount(ctx, &device, &spec.mount_path).await;
        run.ledger.device = Some(device);
        run.ledger.mount = Some(mount?);
        run.advance(ProvisionState::Mounted);

        // Mounted -> IdentitySet
        IdentityRewriter::new(spec.placeholder_hostname.as_str())
            .apply(ctx, &run.identity.name, &spec.mount_path)
            .await?;
        run.advance(ProvisionState::IdentitySet);

        // IdentitySet -> Unmounted
        self.release_storage(ctx, &mut run.ledger).await?;
        run.advance(ProvisionState::Unmounted);

        // Unmounted -> DescriptorCloned
        let descriptor_path = spec.descriptor_path_for(&run.identity.name);
        self.cloner
            .clone(ctx, &spec.descriptor_template_path, &descriptor_path)
            .await?;
        run.ledger.descriptor = Some(descriptor_path.clone());
        run.identity.descriptor_path = Some(descriptor_path.clone());
        run.advance(ProvisionState::DescriptorCloned);

        // DescriptorCloned -> DescriptorEdited
        self.editor
            .apply(ctx, &descriptor_path, &run.identity.name, &disk_path)
            .await?;
        let descriptor = DomainDescriptor::load(ctx, &descriptor_path).await?;
        run.advance(ProvisionState::DescriptorEdited);

        // DescriptorEdited -> Started
        self.hypervisor.register_and_start(ctx, &descriptor_path).await?;
        run.ledger = Ledger::default();
        run.advance(ProvisionState::Started);

        Ok(descriptor)
    }

    /// Reject a candidate name that is already taken.
    async fn reserve(
        &self,
        ctx: &PrivilegedContext,
        spec: &InstanceSpec,
        name: &str,
    ) -> Result<()> {
        if self.hypervisor.instance_exists(ctx, name).await? {
            return Err(ProvisionError::InvalidState(format!(
                "instance '{}' already exists",
                name
            )));
        }
        for path in [spec.disk_path_for(name), spec.descriptor_path_for(name)] {
            if exists(&path).await {
                return Err(ProvisionError::InvalidState(format!(
                    "{} already exists for instance '{}'",
                    path.display(),
                    name
                )));
            }
        }
        info!(instance = %name, "Name reserved");
        Ok(())
    }

    /// Unmount, then unmap. A handle stays in the ledger until its release
    /// succeeds.
    async fn release_storage(&self, ctx: &PrivilegedContext, ledger: &mut Ledger) -> Result<()> {
        if let Some(mut mount) = ledger.mount.take() {
            if let Err(e) = self.mounter.unmount(ctx, &mut mount).await {
                ledger.mount = Some(mount);
                return Err(e);
            }
        }
        if let Some(mut device) = ledger.device.take() {
            if let Err(e) = self.mapper.unmap(ctx, &mut device).await {
                ledger.device = Some(device);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release the ledger in reverse acquisition order, collecting failures.
    async fn rollback(&self, ctx: &PrivilegedContext, ledger: &mut Ledger) -> Vec<String> {
        let mut failures = Vec::new();

        let mut still_mounted = false;
        if let Some(mut mount) = ledger.mount.take() {
            if mount.active {
                if let Err(e) = self.mounter.unmount(ctx, &mut mount).await {
                    still_mounted = true;
                    failures.push(format!("unmount {}: {}", mount.mount_path.display(), e));
                }
            }
        }

        let mut still_mapped = false;
        if let Some(mut device) = ledger.device.take() {
            if still_mounted {
                still_mapped = true;
                failures.push(format!(
                    "unmap {}: skipped while its filesystem is still mounted",
                    device.source.display()
                ));
            } else if device.active {
                if let Err(e) = self.mapper.unmap(ctx, &mut device).await {
                    still_mapped = true;
                    failures.push(format!("unmap {}: {}", device.source.display(), e));
                }
            }
        }

        if let Some(descriptor) = ledger.descriptor.take() {
            if let Err(e) = remove_clone(ctx, &descriptor).await {
                failures.push(format!("remove {}: {}", descriptor.display(), e));
            }
        }

        if let Some(disk) = ledger.disk.take() {
            if still_mapped {
                failures.push(format!("remove {}: skipped while still mapped", disk.display()));
            } else if let Err(e) = remove_clone(ctx, &disk).await {
                failures.push(format!("remove {}: {}", disk.display(), e));
            }
        }

        for failure in &failures {
            warn!(failure = %failure, "Rollback step failed");
        }
        if failures.is_empty() {
            info!("Rollback complete");
        }
        failures
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
