//! Guest identity rewriting.
//!
//! Base images carry a placeholder hostname (`base0` by default). After the
//! cloned disk is mounted, the guest's `/etc/hostname` is replaced with the
//! instance name and every placeholder occurrence in `/etc/hosts` is
//! substituted, leaving all other lines byte-for-byte intact.

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::error::{ProvisionError, Result};
use crate::privilege::PrivilegedContext;
use crate::storage::require_directory;
use crate::types::DEFAULT_PLACEHOLDER_HOSTNAME;

/// Guest hostname file, relative to the mount root.
pub const HOSTNAME_FILE: &str = "etc/hostname";

/// Guest hosts table, relative to the mount root.
pub const HOSTS_FILE: &str = "etc/hosts";

/// Suffix of the scratch file used while replacing the hosts table.
const TEMP_SUFFIX: &str = ".vmclone-tmp";

/// Rewrites identity files inside a mounted guest filesystem.
#[derive(Debug, Clone)]
pub struct IdentityRewriter {
    placeholder: String,
}

impl IdentityRewriter {
    /// Create a rewriter replacing the given placeholder hostname.
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Apply `hostname` to the guest mounted at `mount_path`.
    ///
    /// Both identity files must already exist in the guest; neither is
    /// touched unless both are present.
    #[instrument(skip(self, ctx), fields(mount_path = %mount_path.display()))]
    pub async fn apply(
        &self,
        ctx: &PrivilegedContext,
        hostname: &str,
        mount_path: &Path,
    ) -> Result<()> {
        validate_hostname(hostname)?;
        require_directory(mount_path).await?;

        let hostname_file = mount_path.join(HOSTNAME_FILE);
        let hosts_file = mount_path.join(HOSTS_FILE);

        for file in [&hostname_file, &hosts_file] {
            tokio::fs::metadata(file)
                .await
                .map_err(|e| ProvisionError::io(file, e))?;
        }

        info!(placeholder = %self.placeholder, "Rewriting guest identity");

        ctx.write_file(&hostname_file, hostname.as_bytes()).await?;
        debug!(path = %hostname_file.display(), "Hostname written");

        let hosts = ctx.read_to_string(&hosts_file).await?;
        let rewritten = rewrite_hosts(&hosts, &self.placeholder, hostname);

        let temp = temp_path(&hosts_file);
        ctx.write_file(&temp, rewritten.as_bytes()).await?;
        if let Err(e) = ctx.rename(&temp, &hosts_file).await {
            let _ = ctx.remove_file(&temp).await;
            return Err(e);
        }
        debug!(path = %hosts_file.display(), "Hosts table written");

        info!("Guest identity set");
        Ok(())
    }
}

impl Default for IdentityRewriter {
    fn default() -> Self {
        Self::new(DEFAULT_PLACEHOLDER_HOSTNAME)
    }
}

/// Reject hostnames that would corrupt the identity files.
fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() {
        return Err(ProvisionError::InvalidArgument("hostname must not be empty".into()));
    }
    if hostname.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProvisionError::InvalidArgument(format!(
            "hostname '{}' contains whitespace",
            hostname.escape_debug()
        )));
    }
    Ok(())
}

/// Replace every occurrence of `placeholder` with `hostname`, line by line.
///
/// Line endings, ordering and non-matching lines are preserved exactly.
pub fn rewrite_hosts(content: &str, placeholder: &str, hostname: &str) -> String {
    if placeholder.is_empty() {
        return content.to_string();
    }
    content
        .split_inclusive('\n')
        .map(|line| {
            if line.contains(placeholder) {
                line.replace(placeholder, hostname)
            } else {
                line.to_string()
            }
        })
        .collect()
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_tree(hosts: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join(HOSTNAME_FILE), "base0\n").unwrap();
        std::fs::write(dir.path().join(HOSTS_FILE), hosts).unwrap();
        dir
    }

    #[test]
    fn test_rewrite_hosts_preserves_other_lines() {
        let hosts = "127.0.0.1 base0\n::1 base0\n# comment\n";
        assert_eq!(
            rewrite_hosts(hosts, "base0", "web2"),
            "127.0.0.1 web2\n::1 web2\n# comment\n"
        );
    }

    #[test]
    fn test_rewrite_hosts_keeps_layout() {
        let hosts = "127.0.0.1\tlocalhost\r\n127.0.1.1   base0.lan base0\r\n\n10.0.0.5 db";
        assert_eq!(
            rewrite_hosts(hosts, "base0", "web2"),
            "127.0.0.1\tlocalhost\r\n127.0.1.1   web2.lan web2\r\n\n10.0.0.5 db"
        );
    }

    #[test]
    fn test_rewrite_hosts_without_placeholder_is_identity() {
        let hosts = "127.0.0.1 localhost\n";
        assert_eq!(rewrite_hosts(hosts, "base0", "web2"), hosts);
        assert_eq!(rewrite_hosts(hosts, "", "web2"), hosts);
    }

    #[tokio::test]
    async fn test_apply_rewrites_both_files() {
        let guest = guest_tree("127.0.0.1 base0\n::1 base0\n# comment\n");
        let ctx = PrivilegedContext::unprivileged();

        IdentityRewriter::default()
            .apply(&ctx, "web2", guest.path())
            .await
            .unwrap();

        let hostname = std::fs::read_to_string(guest.path().join(HOSTNAME_FILE)).unwrap();
        assert_eq!(hostname, "web2");
        let hosts = std::fs::read_to_string(guest.path().join(HOSTS_FILE)).unwrap();
        assert_eq!(hosts, "127.0.0.1 web2\n::1 web2\n# comment\n");
        assert!(!guest.path().join("etc/hosts.vmclone-tmp").exists());
    }

    #[tokio::test]
    async fn test_apply_rejects_empty_hostname() {
        let guest = guest_tree("127.0.0.1 base0\n");
        let ctx = PrivilegedContext::unprivileged();
        let err = IdentityRewriter::default()
            .apply(&ctx, "", guest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArgument(_)));

        let err = IdentityRewriter::default()
            .apply(&ctx, "web 2", guest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_apply_missing_hosts_file_touches_nothing() {
        let guest = guest_tree("");
        std::fs::remove_file(guest.path().join(HOSTS_FILE)).unwrap();
        let ctx = PrivilegedContext::unprivileged();

        let err = IdentityRewriter::default()
            .apply(&ctx, "web2", guest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceNotFound(_)));

        let hostname = std::fs::read_to_string(guest.path().join(HOSTNAME_FILE)).unwrap();
        assert_eq!(hostname, "base0\n");
    }

    #[tokio::test]
    async fn test_apply_custom_placeholder() {
        let guest = guest_tree("127.0.1.1 template\n");
        let ctx = PrivilegedContext::unprivileged();

        let rewriter = IdentityRewriter::new("template");
        assert_eq!(rewriter.placeholder(), "template");
        rewriter.apply(&ctx, "ssh0", guest.path()).await.unwrap();

        let hosts = std::fs::read_to_string(guest.path().join(HOSTS_FILE)).unwrap();
        assert_eq!(hosts, "127.0.1.1 ssh0\n");
    }
}
