//! Error types for the provisioning components.

use std::path::Path;
use thiserror::Error;

use crate::types::ProvisionState;

/// Errors that can occur while provisioning an instance.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An expected file or directory is absent.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// A resource is already in a state incompatible with the operation
    /// (double mount, re-mapping a mapped image, releasing twice).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required parameter is empty or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A copy finished but its postcondition could not be verified.
    #[error("Clone incomplete: {0}")]
    CloneIncomplete(String),

    /// The domain descriptor failed to parse or lacks required elements.
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The hypervisor manager could not be queried.
    #[error("Hypervisor unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The hypervisor manager refused to register the instance.
    #[error("Hypervisor rejected the instance: {0}")]
    UpstreamRejected(String),

    /// Elevated privilege is required but could not be obtained.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// An external tool exited unsuccessfully.
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
    },

    /// Filesystem I/O failure not covered by a more specific kind.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Wrap an I/O error with the path it happened on.
    ///
    /// `NotFound` becomes [`ProvisionError::ResourceNotFound`] so callers can
    /// match on the domain kind.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::ResourceNotFound(path.display().to_string());
        }
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::InvalidState(_) => "InvalidState",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::CloneIncomplete(_) => "CloneIncomplete",
            Self::MalformedDescriptor(_) => "MalformedDescriptor",
            Self::UpstreamUnavailable(_) => "UpstreamUnavailable",
            Self::UpstreamRejected(_) => "UpstreamRejected",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::Io { .. } => "Io",
        }
    }
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// A failed provisioning run.
#[derive(Error, Debug)]
#[error("provisioning failed at stage '{stage}'")]
pub struct WorkflowError {
    /// State the run was trying to enter
    pub stage: ProvisionState,
    /// The error that aborted the run
    #[source]
    pub source: ProvisionError,
    /// Cleanup steps that failed during rollback
    pub rollback_failures: Vec<String>,
}

impl WorkflowError {
    /// Whether rollback released everything that was acquired.
    pub fn rolled_back_cleanly(&self) -> bool {
        self.rollback_failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_io_maps_to_resource_not_found() {
        let err = ProvisionError::io(
            Path::new("/nope/etc/hosts"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, ProvisionError::ResourceNotFound(ref p) if p == "/nope/etc/hosts"));
        assert_eq!(err.kind(), "ResourceNotFound");
    }

    #[test]
    fn test_other_io_keeps_source() {
        let err = ProvisionError::io(
            Path::new("/etc/hosts"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.kind(), "Io");
        assert!(err.to_string().contains("/etc/hosts"));
    }

    #[test]
    fn test_workflow_error_names_stage() {
        let err = WorkflowError {
            stage: ProvisionState::Mounted,
            source: ProvisionError::ResourceNotFound("/mnt/vm".into()),
            rollback_failures: Vec::new(),
        };
        assert_eq!(err.to_string(), "provisioning failed at stage 'mounted'");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("Resource not found: /mnt/vm".to_string())
        );
        assert!(err.rolled_back_cleanly());
    }
}
