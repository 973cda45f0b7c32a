//! SSH relay through the gateway host
//!
//! Everything inside the private network is reached through the gateway.
//! [`SshRelay`] drives the system `ssh` and `scp` binaries; the control
//! loop only sees the [`Relay`] trait.

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SshConfig;

/// Output of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Run a shell command on a host reached directly
    async fn run(&self, host: IpAddr, command: &str, timeout: Duration) -> Result<RemoteOutput, RelayError>;

    /// Whether `target` accepts SSH when reached through `gateway`
    async fn probe_via(&self, gateway: IpAddr, target: IpAddr, timeout: Duration) -> Result<bool, RelayError>;

    /// Whether `host` accepts SSH directly
    async fn reachable(&self, host: IpAddr, timeout: Duration) -> Result<bool, RelayError>;

    /// Copy local files or directories into `remote_dir` on `host`
    async fn upload(&self, host: IpAddr, local: &[PathBuf], remote_dir: &str, timeout: Duration) -> Result<(), RelayError>;
}

/// Relay errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("Copy to {host} failed: {stderr}")]
    CopyFailed { host: IpAddr, stderr: String },
}

/// Relay backed by the OpenSSH client binaries
pub struct SshRelay {
    user: String,
    key: PathBuf,
    connect_timeout_secs: u64,
}

impl SshRelay {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            key: config.private_key_path.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }

    fn base_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    fn destination(&self, host: IpAddr) -> String {
        format!("{}@{}", self.user, host)
    }

    /// ProxyCommand reusing our key and options for the jump hop
    fn jump_option(&self, gateway: IpAddr) -> String {
        format!(
            "ProxyCommand=ssh {} -W %h:%p {}",
            self.base_options().join(" "),
            self.destination(gateway)
        )
    }

    async fn exec(&self, program: &str, args: Vec<String>, timeout: Duration) -> Result<RemoteOutput, RelayError> {
        debug!(program, args = ?args, "Spawning");

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RelayError::TimedOut {
                program: program.to_string(),
                timeout,
            })?
            .map_err(|e| RelayError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        Ok(RemoteOutput {
            // Killed by a signal counts as a failure
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Relay for SshRelay {
    async fn run(&self, host: IpAddr, command: &str, timeout: Duration) -> Result<RemoteOutput, RelayError> {
        let mut args = self.base_options();
        args.push(self.destination(host));
        args.push(command.to_string());
        self.exec("ssh", args, timeout).await
    }

    async fn probe_via(&self, gateway: IpAddr, target: IpAddr, timeout: Duration) -> Result<bool, RelayError> {
        let mut args = self.base_options();
        args.push("-o".to_string());
        args.push(self.jump_option(gateway));
        args.push(self.destination(target));
        args.push("true".to_string());

        let output = self.exec("ssh", args, timeout).await?;
        if !output.success() {
            debug!(%gateway, %target, stderr = %output.stderr.trim(), "Relayed probe refused");
        }
        Ok(output.success())
    }

    async fn reachable(&self, host: IpAddr, timeout: Duration) -> Result<bool, RelayError> {
        Ok(self.run(host, "true", timeout).await?.success())
    }

    async fn upload(&self, host: IpAddr, local: &[PathBuf], remote_dir: &str, timeout: Duration) -> Result<(), RelayError> {
        let mkdir = self.run(host, &format!("mkdir -p {}", shell_quote(remote_dir)), timeout).await?;
        if !mkdir.success() {
            return Err(RelayError::CopyFailed {
                host,
                stderr: mkdir.stderr,
            });
        }

        let mut args = self.base_options();
        args.push("-r".to_string());
        args.extend(local.iter().map(|p| p.display().to_string()));
        args.push(format!("{}:{}/", self.destination(host), remote_dir));

        let output = self.exec("scp", args, timeout).await?;
        if !output.success() {
            warn!(%host, stderr = %output.stderr.trim(), "scp failed");
            return Err(RelayError::CopyFailed {
                host,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}
