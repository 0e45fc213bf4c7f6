//! Privileged execution context.
//!
//! Mapping block devices, mounting filesystems and writing into libvirt's
//! directories all need root. The context is acquired once per run and handed
//! to every component that spawns an external tool, so escalation happens in
//! one place instead of being re-decided per call.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{ProvisionError, Result};

/// How external commands are elevated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// The process already runs with euid 0.
    Root,
    /// Commands are prefixed with non-interactive `sudo -n`.
    Sudo { sudo_path: String },
    /// Commands run as the invoking user (mock backends, tests).
    Unprivileged,
}

/// Scoped capability to run privileged commands.
#[derive(Debug, Clone)]
pub struct PrivilegedContext {
    escalation: Escalation,
}

impl PrivilegedContext {
    /// Obtain a privileged context for this run.
    ///
    /// Uses the current identity when it is already root, otherwise verifies
    /// that `sudo -n` works without a password prompt.
    #[instrument]
    pub async fn acquire(allow_sudo: bool) -> Result<Self> {
        if nix::unistd::geteuid().is_root() {
            info!("Running as root, no escalation needed");
            return Ok(Self { escalation: Escalation::Root });
        }

        if !allow_sudo {
            return Err(ProvisionError::PermissionDenied(
                "root privileges are required and sudo is disabled".to_string(),
            ));
        }

        let status = Command::new("sudo")
            .args(["-n", "true"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ProvisionError::PermissionDenied(format!("failed to run sudo: {}", e)))?;

        if !status.success() {
            return Err(ProvisionError::PermissionDenied(
                "sudo requires a password; run as root or configure NOPASSWD".to_string(),
            ));
        }

        info!("Using sudo for privileged commands");
        Ok(Self {
            escalation: Escalation::Sudo { sudo_path: "sudo".to_string() },
        })
    }

    /// Context that runs everything as the current user.
    pub fn unprivileged() -> Self {
        Self { escalation: Escalation::Unprivileged }
    }

    /// How this context elevates commands.
    pub fn escalation(&self) -> &Escalation {
        &self.escalation
    }

    /// Build a command for `program`, elevated according to the context.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = match &self.escalation {
            Escalation::Sudo { sudo_path } => {
                let mut cmd = Command::new(sudo_path);
                cmd.arg("-n").arg(program);
                cmd
            }
            Escalation::Root | Escalation::Unprivileged => Command::new(program),
        };
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run `program` with `args` and return its raw output.
    ///
    /// Only a failure to spawn is an error here; the exit status is left to
    /// the caller.
    pub async fn output<I, S>(&self, program: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(program);
        cmd.args(args);
        debug!(command = ?cmd.as_std(), "Running command");

        cmd.output().await.map_err(|e| ProvisionError::CommandFailed {
            command: program.to_string(),
            stderr: format!("failed to execute: {}", e),
        })
    }

    /// Run `program` with `args` and return stdout, failing on a non-zero exit.
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(program, args).await?;

        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command: program.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // =========================================================================
    // Filesystem mutation
    // =========================================================================

    fn is_sudo(&self) -> bool {
        matches!(self.escalation, Escalation::Sudo { .. })
    }

    fn cat_command(&self, path: &Path) -> Command {
        let mut cmd = self.command("cat");
        cmd.arg("--").arg(path);
        cmd
    }

    /// Read the whole of `path`.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        if !self.is_sudo() {
            return tokio::fs::read(path)
                .await
                .map_err(|e| ProvisionError::io(path, e));
        }

        let output = self
            .cat_command(path)
            .output()
            .await
            .map_err(|e| ProvisionError::CommandFailed {
                command: "cat".to_string(),
                stderr: format!("failed to execute: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such file or directory") {
                return Err(ProvisionError::ResourceNotFound(path.display().to_string()));
            }
            return Err(ProvisionError::CommandFailed {
                command: format!("cat {}", path.display()),
                stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Read `path` as UTF-8 text.
    pub async fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes).map_err(|e| ProvisionError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Check that `path` can be opened for reading.
    pub async fn check_readable(&self, path: &Path) -> Result<()> {
        if !self.is_sudo() {
            return tokio::fs::File::open(path)
                .await
                .map(|_| ())
                .map_err(|e| ProvisionError::io(path, e));
        }
        self.run("test", [OsStr::new("-r"), path.as_os_str()])
            .await
            .map(|_| ())
    }

    /// Write `contents` to `path`, replacing any previous contents.
    pub async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if !self.is_sudo() {
            return tokio::fs::write(path, contents)
                .await
                .map_err(|e| ProvisionError::io(path, e));
        }

        let mut cmd = self.command("tee");
        cmd.arg("--").arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ProvisionError::CommandFailed {
            command: "tee".to_string(),
            stderr: format!("failed to execute: {}", e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).await.map_err(|e| ProvisionError::io(path, e))?;
            stdin.shutdown().await.map_err(|e| ProvisionError::io(path, e))?;
        }

        let output = child.wait_with_output().await.map_err(|e| ProvisionError::io(path, e))?;
        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command: format!("tee {}", path.display()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Atomically replace `to` with `from`.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if !self.is_sudo() {
            return tokio::fs::rename(from, to)
                .await
                .map_err(|e| ProvisionError::io(from, e));
        }
        self.run("mv", [OsStr::new("-f"), OsStr::new("--"), from.as_os_str(), to.as_os_str()])
            .await
            .map(|_| ())
    }

    /// Remove a regular file.
    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        if !self.is_sudo() {
            return tokio::fs::remove_file(path)
                .await
                .map_err(|e| ProvisionError::io(path, e));
        }
        self.run("rm", [OsStr::new("-f"), OsStr::new("--"), path.as_os_str()])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_prefixes_program() {
        let ctx = PrivilegedContext {
            escalation: Escalation::Sudo { sudo_path: "/usr/bin/sudo".to_string() },
        };
        let cmd = ctx.command("kpartx");
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "/usr/bin/sudo");
        let args: Vec<_> = std.get_args().collect();
        assert_eq!(args, vec!["-n", "kpartx"]);
    }

    #[test]
    fn test_sudo_reads_through_cat() {
        let ctx = PrivilegedContext {
            escalation: Escalation::Sudo { sudo_path: "/usr/bin/sudo".to_string() },
        };
        let cmd = ctx.cat_command(Path::new("/etc/libvirt/qemu/base0.xml"));
        let std = cmd.as_std();
        assert_eq!(std.get_program(), "/usr/bin/sudo");
        let args: Vec<_> = std.get_args().collect();
        assert_eq!(args, vec!["-n", "cat", "--", "/etc/libvirt/qemu/base0.xml"]);
    }

    #[tokio::test]
    async fn test_read_helpers_without_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = PrivilegedContext::unprivileged();
        let file = dir.path().join("base0.xml");
        std::fs::write(&file, "<domain/>").unwrap();

        assert_eq!(ctx.read_to_string(&file).await.unwrap(), "<domain/>");
        ctx.check_readable(&file).await.unwrap();
        assert!(matches!(
            ctx.read_file(&dir.path().join("missing.xml")).await,
            Err(ProvisionError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_unprivileged_runs_program_directly() {
        let ctx = PrivilegedContext::unprivileged();
        let cmd = ctx.command("virsh");
        assert_eq!(cmd.as_std().get_program(), "virsh");
        assert_eq!(ctx.escalation(), &Escalation::Unprivileged);
    }

    #[tokio::test]
    async fn test_run_reports_non_zero_exit() {
        let ctx = PrivilegedContext::unprivileged();
        let err = ctx.run("sh", ["-c", "echo boom >&2; exit 3"]).await.unwrap_err();
        match err {
            ProvisionError::CommandFailed { command, stderr } => {
                assert_eq!(command, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_file_helpers_without_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = PrivilegedContext::unprivileged();
        let tmp = dir.path().join("hosts.tmp");
        let target = dir.path().join("hosts");

        ctx.write_file(&tmp, b"127.0.0.1 web2\n").await.unwrap();
        ctx.rename(&tmp, &target).await.unwrap();
        assert!(!tmp.exists());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "127.0.0.1 web2\n");

        ctx.remove_file(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_run_returns_stdout() {
        let ctx = PrivilegedContext::unprivileged();
        let out = ctx.run("sh", ["-c", "printf hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }
}
