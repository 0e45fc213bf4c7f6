//! `virsh`-based hypervisor client.
//!
//! Listing uses `virsh list --all --name`, which prints one domain name per
//! line and nothing else, so no column parsing is needed.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use crate::traits::HypervisorClient;

/// Default libvirt connection URI.
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Hypervisor client shelling out to `virsh`.
pub struct VirshClient {
    virsh_path: String,
    uri: String,
}

impl VirshClient {
    /// Create a client for the given connection URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            virsh_path: "virsh".to_string(),
            uri: uri.into(),
        }
    }

    /// Set the virsh binary path.
    pub fn with_virsh(mut self, path: impl Into<String>) -> Self {
        self.virsh_path = path.into();
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Default for VirshClient {
    fn default() -> Self {
        Self::new(DEFAULT_LIBVIRT_URI)
    }
}

/// Parse `virsh list --name` output into domain names.
pub fn parse_name_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl HypervisorClient for VirshClient {
    fn name(&self) -> &str {
        "virsh"
    }

    #[instrument(skip(self, ctx), fields(uri = %self.uri))]
    async fn list_instances(&self, ctx: &PrivilegedContext) -> Result<Vec<String>> {
        let args = [
            OsStr::new("--connect"),
            OsStr::new(&self.uri),
            OsStr::new("list"),
            OsStr::new("--all"),
            OsStr::new("--name"),
        ];
        let output = ctx
            .run(&self.virsh_path, args)
            .await
            .map_err(|e| ProvisionError::UpstreamUnavailable(e.to_string()))?;

        let names = parse_name_listing(&output);
        debug!(count = names.len(), "Listed domains");
        Ok(names)
    }

    #[instrument(skip(self, ctx), fields(uri = %self.uri, descriptor = %descriptor_path.display()))]
    async fn create_from_descriptor(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
    ) -> Result<()> {
        let args = [
            OsStr::new("--connect"),
            OsStr::new(&self.uri),
            OsStr::new("create"),
            descriptor_path.as_os_str(),
        ];
        let output = ctx
            .output(&self.virsh_path, args)
            .await
            .map_err(|e| ProvisionError::UpstreamUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisionError::UpstreamRejected(stderr));
        }

        info!(output = %String::from_utf8_lossy(&output.stdout).trim(), "Domain created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_listing() {
        let output = "web0\nweb1\nssh0\n\n";
        assert_eq!(parse_name_listing(output), vec!["web0", "web1", "ssh0"]);
        assert!(parse_name_listing("\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_virsh_is_unavailable_not_zero() {
        let client = VirshClient::default().with_virsh("/nonexistent/virsh");
        let ctx = PrivilegedContext::unprivileged();

        let err = client.count_by_prefix(&ctx, "web").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failing_listing_is_unavailable() {
        let client = VirshClient::default().with_virsh("false");
        let ctx = PrivilegedContext::unprivileged();

        let err = client.list_instances(&ctx).await.unwrap_err();
        assert!(matches!(err, ProvisionError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_prefix_is_rejected() {
        let client = VirshClient::default();
        let ctx = PrivilegedContext::unprivileged();

        let err = client.count_by_prefix(&ctx, "").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_refused_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("web2.xml");
        std::fs::write(&descriptor, "<domain/>").unwrap();

        let client = VirshClient::default().with_virsh("false");
        let ctx = PrivilegedContext::unprivileged();

        let err = client.register_and_start(&ctx, &descriptor).await.unwrap_err();
        assert!(matches!(err, ProvisionError::UpstreamRejected(_)));
    }

    #[tokio::test]
    async fn test_register_requires_descriptor() {
        let client = VirshClient::default().with_virsh("true");
        let ctx = PrivilegedContext::unprivileged();

        let err = client
            .register_and_start(&ctx, Path::new("/nonexistent/web2.xml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceNotFound(_)));
    }
}
