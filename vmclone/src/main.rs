//! # vmclone
//!
//! Clones a base disk image into a new, uniquely named virtual machine:
//! copies the disk, rewrites the guest's hostname files, writes a domain
//! descriptor for the new instance and starts it through libvirt.
//!
//! ## Usage
//! ```bash
//! vmclone web /srv/base/base0.xml /srv/base/base0.img /mnt/vmclone
//! vmclone ssh base.xml base.img /mnt/vmclone --storage-path /srv/images --log-format json
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod lock;
mod provision;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    vmclone_common::init_logging(&args.log_level, args.log_format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vmclone");

    // Load configuration
    let config = match Config::resolve(args.config.as_deref()) {
        Ok((cfg, Some(path))) => {
            info!(config_path = %path.display(), "Configuration loaded");
            cfg.with_cli_overrides(&args)
        }
        Ok((cfg, None)) => {
            info!("No config file found, using CLI arguments and defaults");
            cfg.with_cli_overrides(&args)
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    let spec = config.instance_spec(&args);
    info!(
        prefix = %spec.type_prefix,
        storage = %spec.storage_path.display(),
        backend = ?config.hypervisor.backend,
        "vmclone configured"
    );

    match provision::run(&config, &spec).await {
        Ok(outcome) => {
            info!(
                instance = %outcome.identity.name,
                disk = ?outcome.identity.disk_path(),
                descriptor = ?outcome.identity.descriptor_path(),
                "Instance started"
            );
            println!("{}", outcome.identity.name);
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "vmclone failed");
            Err(e)
        }
    }
}
