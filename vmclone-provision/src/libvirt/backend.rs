//! Libvirt client implementation.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use crate::traits::HypervisorClient;

/// Hypervisor client backed by a libvirt connection.
pub struct LibvirtClient {
    uri: String,
    connection: Connect,
}

impl LibvirtClient {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| ProvisionError::UpstreamUnavailable(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl HypervisorClient for LibvirtClient {
    fn name(&self) -> &str {
        "libvirt"
    }

    #[instrument(skip(self, _ctx), fields(uri = %self.uri))]
    async fn list_instances(&self, _ctx: &PrivilegedContext) -> Result<Vec<String>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE |
                    sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

        let domains = self.connection.list_all_domains(flags)
            .map_err(|e| ProvisionError::UpstreamUnavailable(e.to_string()))?;

        let mut names = Vec::with_capacity(domains.len());
        for domain in domains {
            let name = domain.get_name()
                .map_err(|e| ProvisionError::UpstreamUnavailable(e.to_string()))?;
            names.push(name);
        }

        debug!(count = names.len(), "Listed domains");
        Ok(names)
    }

    #[instrument(
        skip(self, ctx),
        fields(uri = %self.uri, descriptor = %descriptor_path.display())
    )]
    async fn create_from_descriptor(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
    ) -> Result<()> {
        let xml = ctx.read_to_string(descriptor_path).await?;

        let domain = Domain::create_xml(&self.connection, &xml, sys::VIR_DOMAIN_NONE)
            .map_err(|e| ProvisionError::UpstreamRejected(e.to_string()))?;

        let uuid = domain.get_uuid_string()
            .map_err(|e| ProvisionError::UpstreamRejected(e.to_string()))?;

        info!(vm_id = %uuid, "Domain created and started");
        Ok(())
    }
}
