//! Backend selection and one provisioning run.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use vmclone_provision::{
    BlockDeviceMapper, CommandMounter, DiskCloner, Escalation, FilesystemMounter, HypervisorClient,
    InstanceSpec, KpartxMapper, MockDeviceMapper, MockHypervisor, MockMounter, PrivilegedContext,
    ProvisionOutcome, ProvisioningWorkflow, VirshClient,
};

use crate::config::{Config, HypervisorBackend};
use crate::lock::RunLock;

/// Backends serving one run.
struct Backends {
    hypervisor: Arc<dyn HypervisorClient>,
    mapper: Arc<dyn BlockDeviceMapper>,
    mounter: Arc<dyn FilesystemMounter>,
}

async fn build_backends(config: &Config) -> Result<Backends> {
    let tools = &config.tools;

    let hypervisor: Arc<dyn HypervisorClient> = match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock backends");
            return Ok(Backends {
                hypervisor: Arc::new(MockHypervisor::new()),
                mapper: Arc::new(MockDeviceMapper::new()),
                mounter: Arc::new(MockMounter::new()),
            });
        }
        HypervisorBackend::Virsh => {
            info!(uri = %config.hypervisor.uri, "Using virsh backend");
            Arc::new(
                VirshClient::new(config.hypervisor.uri.clone())
                    .with_virsh(config.hypervisor.virsh_path.clone()),
            )
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                info!(uri = %config.hypervisor.uri, "Connecting to libvirt");
                Arc::new(
                    vmclone_provision::LibvirtClient::new(&config.hypervisor.uri)
                        .await
                        .context("Failed to connect to libvirt")?,
                )
            }
            #[cfg(not(feature = "libvirt"))]
            {
                bail!("Libvirt backend requested but not compiled in; use --backend virsh");
            }
        }
    };

    Ok(Backends {
        hypervisor,
        mapper: Arc::new(
            KpartxMapper::new()
                .with_kpartx(tools.kpartx.clone())
                .with_losetup(tools.losetup.clone()),
        ),
        mounter: Arc::new(
            CommandMounter::new()
                .with_tools(tools.mount.clone(), tools.umount.clone())
                .with_mountpoint(tools.mountpoint.clone()),
        ),
    })
}

async fn privileged_context(config: &Config) -> Result<PrivilegedContext> {
    if config.hypervisor.backend == HypervisorBackend::Mock {
        return Ok(PrivilegedContext::unprivileged());
    }

    let ctx = PrivilegedContext::acquire(config.privilege.allow_sudo)
        .await
        .context("Provisioning needs root or passwordless sudo")?;
    if let Escalation::Sudo { .. } = ctx.escalation() {
        info!("Not running as root, escalating through sudo");
    }
    Ok(ctx)
}

/// Provision one instance under the host run lock.
pub async fn run(config: &Config, spec: &InstanceSpec) -> Result<ProvisionOutcome> {
    let ctx = privileged_context(config).await?;
    let backends = build_backends(config).await?;

    let _lock = RunLock::acquire(config.lock_path())?;

    let workflow = ProvisioningWorkflow::new(backends.hypervisor, backends.mapper, backends.mounter)
        .with_cloner(DiskCloner::new().with_cp(config.tools.cp.clone()));

    match workflow.run(&ctx, spec).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            for failure in &e.rollback_failures {
                warn!(failure = %failure, "Left behind by rollback");
            }
            error!(stage = %e.stage, kind = e.source.kind(), "Provisioning failed");
            Err(e.into())
        }
    }
}
