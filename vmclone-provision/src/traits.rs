//! Hypervisor manager client trait.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;

/// Client of the external hypervisor manager.
///
/// Backends implement the two primitive calls; naming and registration
/// preconditions live in the provided methods so every backend enforces
/// them the same way.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Names of all defined instances, running or stopped.
    ///
    /// Any failure to query must surface as
    /// [`ProvisionError::UpstreamUnavailable`].
    async fn list_instances(&self, ctx: &PrivilegedContext) -> Result<Vec<String>>;

    /// Create and start a transient instance from a descriptor file.
    ///
    /// Refusals surface as [`ProvisionError::UpstreamRejected`] with the
    /// manager's diagnostic.
    async fn create_from_descriptor(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
    ) -> Result<()>;

    /// Count instances whose name contains `prefix`.
    ///
    /// An empty prefix is rejected; a failed query is never reported as
    /// zero instances.
    async fn count_by_prefix(&self, ctx: &PrivilegedContext, prefix: &str) -> Result<usize> {
        if prefix.is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "cannot count instances for an empty prefix".to_string(),
            ));
        }

        let names = self.list_instances(ctx).await?;
        let count = names.iter().filter(|n| n.contains(prefix)).count();

        debug!(
            backend = self.name(),
            prefix = %prefix,
            total = names.len(),
            count,
            "Counted instances"
        );
        Ok(count)
    }

    /// Whether an instance named exactly `name` is defined.
    async fn instance_exists(&self, ctx: &PrivilegedContext, name: &str) -> Result<bool> {
        Ok(self.list_instances(ctx).await?.iter().any(|n| n == name))
    }

    /// Submit `descriptor_path` for immediate creation and start.
    async fn register_and_start(
        &self,
        ctx: &PrivilegedContext,
        descriptor_path: &Path,
    ) -> Result<()> {
        tokio::fs::metadata(descriptor_path)
            .await
            .map_err(|e| ProvisionError::io(descriptor_path, e))?;

        info!(
            backend = self.name(),
            descriptor = %descriptor_path.display(),
            "Registering instance"
        );
        self.create_from_descriptor(ctx, descriptor_path).await
    }
}
