//! Remote shell execution over a multiplexed SSH session.
//!
//! One transport per host, one long-lived control channel per transport.
//! Commands are handed to the remote shell as a single string; callers
//! interpolate arguments as already-escaped text (see [`shell_quote`]).
//! Host identity is not verified in this deployment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Output from executing a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code
    pub exit_code: i32,
    /// Whether the command exited zero
    pub success: bool,
}

impl CommandOutput {
    /// Get stdout lines as a vector
    #[must_use]
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }

    /// Get stdout with surrounding whitespace removed
    #[must_use]
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
        }
    }
}

/// Transport for running commands and copying files on one remote host.
///
/// Implementations are not safe for re-entrant use: a single host driver
/// is the only caller of its transport.
#[async_trait]
pub trait ShellTransport: std::fmt::Debug + Send + Sync {
    /// Run a shell command on the host.
    ///
    /// A non-zero exit status is reported in the returned output, not as
    /// an error; only a transport-level failure errors.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Copy a local file onto the host
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Display name of the remote target
    fn host(&self) -> &str;

    /// Run a shell command and fail on a non-zero exit status
    async fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if !output.success {
            return Err(Error::command_failed(
                self.host(),
                command,
                output.exit_code,
                output.stdout,
                output.stderr,
            ));
        }
        Ok(output)
    }
}

/// [`ShellTransport`] over the system ssh client.
///
/// All commands share an OpenSSH control channel (`ControlMaster=auto`,
/// `ControlPersist`) so only the first command pays the handshake.
#[derive(Debug, Clone)]
pub struct SshTransport {
    target: String,
    control_path: PathBuf,
}

impl SshTransport {
    /// Create a transport for a `[user@]ip` target
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let control_path = std::env::temp_dir().join(format!("hypervisor-{target}.ctl"));
        Self {
            target,
            control_path,
        }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "ControlPersist=yes".into(),
        ]
    }
}

#[async_trait]
impl ShellTransport for SshTransport {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.target, %command, "running remote command");
        let output = Command::new("ssh")
            .args(self.common_options())
            .arg(&self.target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output.into())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let destination = format!("{}:{}", self.target, remote);
        debug!(host = %self.target, %remote, "uploading file");
        let output = Command::new("scp")
            .args(self.common_options())
            .arg(local)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let output = CommandOutput::from(output);
        if !output.success {
            return Err(Error::command_failed(
                &self.target,
                format!("scp {} {destination}", local.display()),
                output.exit_code,
                output.stdout,
                output.stderr,
            ));
        }
        Ok(())
    }

    fn host(&self) -> &str {
        &self.target
    }
}

/// Quote a string for interpolation into a remote shell command
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Verify that the ssh and scp client binaries are available.
///
/// Called once at startup, before any host is contacted.
pub fn ensure_client_binaries() -> Result<()> {
    for binary in ["ssh", "scp"] {
        which::which(binary).map_err(|_| Error::binary_not_found(binary))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_helpers() {
        let output = CommandOutput {
            stdout: " line1\nline2 \n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        };
        assert_eq!(output.stdout_lines(), vec![" line1", "line2 "]);
        assert_eq!(output.stdout_trimmed(), "line1\nline2");
    }

    #[test]
    fn ssh_options_disable_host_key_checks() {
        let transport = SshTransport::new("root@10.0.0.1");
        let options = transport.common_options().join(" ");
        assert!(options.contains("StrictHostKeyChecking=no"));
        assert!(options.contains("ControlMaster=auto"));
        assert!(options.contains("hypervisor-root@10.0.0.1.ctl"));
        assert_eq!(transport.host(), "root@10.0.0.1");
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }
}
