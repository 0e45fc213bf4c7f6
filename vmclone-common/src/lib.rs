//! # vmclone Common
//!
//! Shared utilities for the vmclone crates.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use vmclone_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(instance = "web2", "Provisioning started");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{
    init_logging,
    init_logging_json,
    init_logging_pretty,
    LogFormat,
};
