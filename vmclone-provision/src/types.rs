//! Data types for a provisioning run.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

/// Guest hostname baked into base images before identity rewriting.
pub const DEFAULT_PLACEHOLDER_HOSTNAME: &str = "base0";

/// Default directory for cloned instance disks.
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/libvirt/images";

/// Default directory libvirt scans for domain descriptors.
pub const DEFAULT_DESCRIPTOR_DIR: &str = "/etc/libvirt/qemu";

/// Extension given to cloned instance disks.
pub const DISK_EXTENSION: &str = "img";

/// Extension given to generated domain descriptors.
pub const DESCRIPTOR_EXTENSION: &str = "xml";

// =============================================================================
// Instance Spec
// =============================================================================

/// Input to one provisioning run. Owned by the caller, never mutated.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Instance type, e.g. "web" or "ssh". Names become `<prefix><count>`.
    pub type_prefix: String,
    /// Domain descriptor template of the base image
    pub descriptor_template_path: PathBuf,
    /// Base disk image to clone
    pub base_image_path: PathBuf,
    /// Scratch directory where the cloned disk's root filesystem is mounted
    pub mount_path: PathBuf,
    /// Directory receiving cloned disks
    pub storage_path: PathBuf,
    /// Directory receiving generated descriptors
    pub descriptor_output_dir: PathBuf,
    /// Hostname marker in the base image's hosts table
    pub placeholder_hostname: String,
}

impl InstanceSpec {
    /// Create a spec with default storage and descriptor locations.
    pub fn new(
        type_prefix: impl Into<String>,
        descriptor_template_path: impl Into<PathBuf>,
        base_image_path: impl Into<PathBuf>,
        mount_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            type_prefix: type_prefix.into(),
            descriptor_template_path: descriptor_template_path.into(),
            base_image_path: base_image_path.into(),
            mount_path: mount_path.into(),
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            descriptor_output_dir: PathBuf::from(DEFAULT_DESCRIPTOR_DIR),
            placeholder_hostname: DEFAULT_PLACEHOLDER_HOSTNAME.to_string(),
        }
    }

    /// Set the storage directory.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Set the descriptor output directory.
    pub fn with_descriptor_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_output_dir = path.into();
        self
    }

    /// Set the placeholder hostname replaced inside the guest.
    pub fn with_placeholder_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.placeholder_hostname = hostname.into();
        self
    }

    /// Check the parameters that can be validated without touching the host.
    pub fn validate(&self) -> Result<()> {
        if self.type_prefix.trim().is_empty() {
            return Err(ProvisionError::InvalidArgument("type prefix must not be empty".into()));
        }
        if self.type_prefix.contains(|c: char| c == '/' || c.is_whitespace()) {
            return Err(ProvisionError::InvalidArgument(format!(
                "type prefix '{}' must not contain '/' or whitespace",
                self.type_prefix
            )));
        }
        if self.placeholder_hostname.is_empty() {
            return Err(ProvisionError::InvalidArgument(
                "placeholder hostname must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Disk path assigned to an instance name.
    pub fn disk_path_for(&self, name: &str) -> PathBuf {
        self.storage_path.join(format!("{}.{}", name, DISK_EXTENSION))
    }

    /// Descriptor path assigned to an instance name.
    pub fn descriptor_path_for(&self, name: &str) -> PathBuf {
        self.descriptor_output_dir.join(format!("{}.{}", name, DESCRIPTOR_EXTENSION))
    }
}

// =============================================================================
// Instance Identity
// =============================================================================

/// Identity assigned to the instance being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// Instance name, also used as the guest hostname
    pub name: String,
    /// Path of the cloned disk, set once the disk is cloned
    pub disk_path: Option<PathBuf>,
    /// Path of the generated descriptor, set once it is cloned
    pub descriptor_path: Option<PathBuf>,
}

impl InstanceIdentity {
    /// Derive the identity from a type prefix and the number of existing
    /// instances sharing it.
    pub fn from_count(prefix: &str, count: usize) -> Self {
        Self {
            name: format!("{}{}", prefix, count),
            disk_path: None,
            descriptor_path: None,
        }
    }

    pub fn disk_path(&self) -> Option<&Path> {
        self.disk_path.as_deref()
    }

    pub fn descriptor_path(&self) -> Option<&Path> {
        self.descriptor_path.as_deref()
    }
}

// =============================================================================
// Workflow State
// =============================================================================

/// States of the provisioning workflow, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionState {
    Init,
    Named,
    DiskCloned,
    Mounted,
    IdentitySet,
    Unmounted,
    DescriptorCloned,
    DescriptorEdited,
    Started,
    Failed,
}

impl ProvisionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Started | Self::Failed)
    }

    /// The state a successful step leads to.
    pub fn next(self) -> Option<Self> {
        use ProvisionState::*;
        match self {
            Init => Some(Named),
            Named => Some(DiskCloned),
            DiskCloned => Some(Mounted),
            Mounted => Some(IdentitySet),
            IdentitySet => Some(Unmounted),
            Unmounted => Some(DescriptorCloned),
            DescriptorCloned => Some(DescriptorEdited),
            DescriptorEdited => Some(Started),
            Started | Failed => None,
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Named => "named",
            Self::DiskCloned => "disk-cloned",
            Self::Mounted => "mounted",
            Self::IdentitySet => "identity-set",
            Self::Unmounted => "unmounted",
            Self::DescriptorCloned => "descriptor-cloned",
            Self::DescriptorEdited => "descriptor-edited",
            Self::Started => "started",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_count() {
        let identity = InstanceIdentity::from_count("web", 2);
        assert_eq!(identity.name, "web2");
        assert!(identity.disk_path().is_none());
    }

    #[test]
    fn test_spec_paths() {
        let spec = InstanceSpec::new("web", "/tmpl/base.xml", "/img/base.img", "/mnt/vm")
            .with_storage_path("/srv/images")
            .with_descriptor_dir("/srv/xml");
        assert_eq!(spec.disk_path_for("web2"), PathBuf::from("/srv/images/web2.img"));
        assert_eq!(spec.descriptor_path_for("web2"), PathBuf::from("/srv/xml/web2.xml"));
    }

    #[test]
    fn test_spec_validation() {
        let spec = InstanceSpec::new("", "/t.xml", "/b.img", "/mnt");
        assert!(matches!(spec.validate(), Err(ProvisionError::InvalidArgument(_))));

        let spec = InstanceSpec::new("web/x", "/t.xml", "/b.img", "/mnt");
        assert!(spec.validate().is_err());

        let spec = InstanceSpec::new("web", "/t.xml", "/b.img", "/mnt");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_state_sequence_ends_in_started() {
        let mut state = ProvisionState::Init;
        let mut steps = 0;
        while let Some(next) = state.next() {
            state = next;
            steps += 1;
        }
        assert_eq!(state, ProvisionState::Started);
        assert_eq!(steps, 8);
        assert!(state.is_terminal());
        assert!(ProvisionState::Failed.is_terminal());
        assert!(!ProvisionState::Mounted.is_terminal());
    }
}
