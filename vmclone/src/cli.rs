//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

use vmclone_common::LogFormat;

use crate::config::HypervisorBackend;

/// vmclone - Clone a base image into a new virtual machine and start it
#[derive(Parser, Debug)]
#[command(name = "vmclone")]
#[command(about = "Clone a base image into a new virtual machine and start it")]
#[command(version)]
pub struct Args {
    /// Instance type prefix; the new instance is named <prefix><count>
    pub type_prefix: String,

    /// Domain XML template of the base image
    pub descriptor_template: PathBuf,

    /// Base disk image to clone
    pub base_image: PathBuf,

    /// Scratch directory where the clone's root filesystem is mounted
    pub mount_path: PathBuf,

    /// Directory receiving cloned disks
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Directory receiving generated domain XML
    #[arg(long)]
    pub descriptor_dir: Option<PathBuf>,

    /// Hostname baked into the base image
    #[arg(long)]
    pub placeholder_hostname: Option<String>,

    /// Hypervisor backend (virsh, libvirt, mock)
    #[arg(long, value_enum)]
    pub backend: Option<HypervisorBackend>,

    /// Libvirt connection URI
    #[arg(long)]
    pub libvirt_uri: Option<String>,

    /// Fail instead of escalating through `sudo -n` when not root
    #[arg(long)]
    pub no_sudo: bool,

    /// Path to configuration file (defaults used if the default file is absent)
    #[arg(short, long, env = "VMCLONE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let args = Args::try_parse_from([
            "vmclone",
            "web",
            "/srv/base.xml",
            "/srv/base.img",
            "/mnt/vm",
        ])
        .unwrap();

        assert_eq!(args.type_prefix, "web");
        assert_eq!(args.base_image, PathBuf::from("/srv/base.img"));
        assert_eq!(args.mount_path, PathBuf::from("/mnt/vm"));
        assert!(args.storage_path.is_none());
        assert!(args.backend.is_none());
        assert!(!args.no_sudo);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_options() {
        let args = Args::try_parse_from([
            "vmclone",
            "ssh",
            "t.xml",
            "b.img",
            "/mnt",
            "--storage-path",
            "/srv/images",
            "--backend",
            "mock",
            "--no-sudo",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(args.storage_path, Some(PathBuf::from("/srv/images")));
        assert_eq!(args.backend, Some(HypervisorBackend::Mock));
        assert!(args.no_sudo);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_missing_positional_is_an_error() {
        assert!(Args::try_parse_from(["vmclone", "web", "t.xml"]).is_err());
        let unknown_backend = ["vmclone", "web", "t.xml", "b.img", "/mnt", "--backend", "xen"];
        assert!(Args::try_parse_from(unknown_backend).is_err());
    }
}
