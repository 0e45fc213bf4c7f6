//! Configuration management for vmclone.
//!
//! Precedence is CLI arguments, then the YAML file, then built-in defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use vmclone_provision::{
    InstanceSpec, DEFAULT_DESCRIPTOR_DIR, DEFAULT_LIBVIRT_URI, DEFAULT_PLACEHOLDER_HOSTNAME,
    DEFAULT_STORAGE_PATH,
};

use crate::cli::Args;

/// Location read when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmclone/vmclone.yaml";

/// Name of the run lock created in the storage directory.
pub const LOCK_FILE_NAME: &str = ".vmclone.lock";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where disks and descriptors are written
    pub storage: StorageConfig,
    /// Guest image conventions
    pub guest: GuestConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Privilege escalation
    pub privilege: PrivilegeConfig,
    /// External tool paths
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the file named on the command line, or the default file if it
    /// exists. An explicit path that cannot be loaded is an error.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match explicit {
            Some(path) => Ok((Self::load(path)?, Some(path.to_path_buf()))),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Ok((Self::load(default_path)?, Some(default_path.to_path_buf())))
                } else {
                    Ok((Self::default(), None))
                }
            }
        }
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref path) = args.storage_path {
            self.storage.storage_path = path.clone();
        }

        if let Some(ref dir) = args.descriptor_dir {
            self.storage.descriptor_dir = dir.clone();
        }

        if let Some(ref placeholder) = args.placeholder_hostname {
            self.guest.placeholder_hostname = placeholder.clone();
        }

        if let Some(backend) = args.backend {
            self.hypervisor.backend = backend;
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.uri = uri.clone();
        }

        if args.no_sudo {
            self.privilege.allow_sudo = false;
        }

        self
    }

    /// Build the provisioning input for this run.
    pub fn instance_spec(&self, args: &Args) -> InstanceSpec {
        InstanceSpec::new(
            args.type_prefix.clone(),
            &args.descriptor_template,
            &args.base_image,
            &args.mount_path,
        )
        .with_storage_path(&self.storage.storage_path)
        .with_descriptor_dir(&self.storage.descriptor_dir)
        .with_placeholder_hostname(self.guest.placeholder_hostname.clone())
    }

    /// Path of the host-wide run lock.
    pub fn lock_path(&self) -> PathBuf {
        self.storage
            .lock_file
            .clone()
            .unwrap_or_else(|| self.storage.storage_path.join(LOCK_FILE_NAME))
    }
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory receiving cloned disks
    pub storage_path: PathBuf,
    /// Directory receiving generated descriptors
    pub descriptor_dir: PathBuf,
    /// Run lock location (defaults to a file in `storage_path`)
    pub lock_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            descriptor_dir: PathBuf::from(DEFAULT_DESCRIPTOR_DIR),
            lock_file: None,
        }
    }
}

/// Guest image conventions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Hostname baked into base images
    pub placeholder_hostname: String,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            placeholder_hostname: DEFAULT_PLACEHOLDER_HOSTNAME.to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub uri: String,
    /// virsh binary
    pub virsh_path: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::default(),
            uri: DEFAULT_LIBVIRT_URI.to_string(),
            virsh_path: "virsh".to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// `virsh` command-line client
    #[default]
    Virsh,
    /// Libvirt C API (requires the `libvirt` feature)
    Libvirt,
    /// In-memory backends for development
    Mock,
}

/// Privilege escalation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Escalate through `sudo -n` when not running as root
    pub allow_sudo: bool,
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self { allow_sudo: true }
    }
}

/// External tool paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub kpartx: String,
    pub losetup: String,
    pub mount: String,
    pub umount: String,
    pub mountpoint: String,
    pub cp: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kpartx: "kpartx".to_string(),
            losetup: "losetup".to_string(),
            mount: "mount".to_string(),
            umount: "umount".to_string(),
            mountpoint: "mountpoint".to_string(),
            cp: "cp".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["vmclone", "web", "/srv/base.xml", "/srv/base.img", "/mnt/vm"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.storage_path, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(config.storage.descriptor_dir, PathBuf::from("/etc/libvirt/qemu"));
        assert_eq!(config.guest.placeholder_hostname, "base0");
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Virsh);
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert!(config.privilege.allow_sudo);
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/var/lib/libvirt/images/.vmclone.lock")
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmclone.yaml");
        std::fs::write(
            &path,
            "storage:\n  storage_path: /srv/images\n\
             hypervisor:\n  backend: mock\n\
             tools:\n  cp: /usr/local/bin/cp\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.storage_path, PathBuf::from("/srv/images"));
        assert_eq!(config.storage.descriptor_dir, PathBuf::from("/etc/libvirt/qemu"));
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert_eq!(config.tools.cp, "/usr/local/bin/cp");
        assert_eq!(config.tools.kpartx, "kpartx");
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(Config::resolve(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmclone.yaml");
        std::fs::write(&path, "hypervisor:\n  backend: xen\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = Config {
            storage: StorageConfig {
                storage_path: PathBuf::from("/srv/images"),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = config.with_cli_overrides(&args(&[
            "--storage-path",
            "/data/images",
            "--placeholder-hostname",
            "template",
            "--libvirt-uri",
            "qemu+ssh://host/system",
            "--no-sudo",
        ]));

        assert_eq!(config.storage.storage_path, PathBuf::from("/data/images"));
        assert_eq!(config.guest.placeholder_hostname, "template");
        assert_eq!(config.hypervisor.uri, "qemu+ssh://host/system");
        assert!(!config.privilege.allow_sudo);
    }

    #[test]
    fn test_instance_spec() {
        let args = args(&["--descriptor-dir", "/srv/xml"]);
        let config = Config::default().with_cli_overrides(&args);
        let spec = config.instance_spec(&args);

        assert_eq!(spec.type_prefix, "web");
        assert_eq!(spec.descriptor_template_path, PathBuf::from("/srv/base.xml"));
        assert_eq!(spec.descriptor_path_for("web2"), PathBuf::from("/srv/xml/web2.xml"));
        assert_eq!(spec.disk_path_for("web2"), PathBuf::from("/var/lib/libvirt/images/web2.img"));
    }

    #[test]
    fn test_lock_file_override() {
        let mut config = Config::default();
        config.storage.lock_file = Some(PathBuf::from("/run/vmclone.lock"));
        assert_eq!(config.lock_path(), PathBuf::from("/run/vmclone.lock"));
    }
}
