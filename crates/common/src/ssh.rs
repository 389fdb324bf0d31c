// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - SSH Command Builder
// Builds invocations of the system ssh client for remote commands and local forwards

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Who to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SshTarget {
    /// A `Host` alias resolved by ssh itself from ~/.ssh/config
    Alias { name: String },
    /// Explicit server, user and optional identity file
    Explicit {
        host: String,
        user: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_path: Option<PathBuf>,
    },
}

impl SshTarget {
    pub fn alias(name: impl Into<String>) -> Self {
        SshTarget::Alias { name: name.into() }
    }

    pub fn explicit(host: impl Into<String>, user: impl Into<String>, key_path: Option<PathBuf>) -> Self {
        SshTarget::Explicit {
            host: host.into(),
            user: user.into(),
            key_path,
        }
    }

    /// Trailing destination arguments: `alias` or `[-i key] user@host`
    fn destination_args(&self) -> Vec<String> {
        match self {
            SshTarget::Alias { name } => vec![name.clone()],
            SshTarget::Explicit { host, user, key_path } => {
                let mut args = Vec::with_capacity(3);
                if let Some(key) = key_path {
                    args.push("-i".to_string());
                    args.push(key.display().to_string());
                }
                args.push(format!("{}@{}", user, host));
                args
            }
        }
    }
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshTarget::Alias { name } => write!(f, "{}", name),
            SshTarget::Explicit { host, user, .. } => write!(f, "{}@{}", user, host),
        }
    }
}

/// Host key verification behaviour passed to ssh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Refuse unknown or changed host keys
    #[default]
    Strict,
    /// Accept any host key and never record it (MITM risk)
    Disabled,
}

impl HostKeyPolicy {
    pub fn from_insecure(insecure: bool) -> Self {
        if insecure {
            HostKeyPolicy::Disabled
        } else {
            HostKeyPolicy::Strict
        }
    }

    fn option_args(&self) -> &'static [&'static str] {
        match self {
            HostKeyPolicy::Strict => &["-o", "StrictHostKeyChecking=yes"],
            HostKeyPolicy::Disabled => &[
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
            ],
        }
    }
}

/// Anything the tunnel manager can spawn forwards through
///
/// The returned command must forward `local_port` to `remote_port`, stay
/// resident, and exit only when killed or when the forward breaks.
pub trait ForwardLauncher: Send + Sync {
    fn forward_command(&self, policy: HostKeyPolicy, local_port: u16, remote_port: u16) -> Command;
}

/// Builder for ssh invocations against one target
#[derive(Debug, Clone)]
pub struct SshClient {
    program: OsString,
    target: SshTarget,
    policy: HostKeyPolicy,
}

impl SshClient {
    pub fn new(target: SshTarget) -> Self {
        Self {
            program: OsString::from("ssh"),
            target,
            policy: HostKeyPolicy::default(),
        }
    }

    /// Use a different ssh executable
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        self.policy
    }

    fn base_args(policy: HostKeyPolicy) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "LogLevel=ERROR".to_string()];
        args.extend(policy.option_args().iter().map(|s| s.to_string()));
        // Never fall back to an interactive password prompt
        args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        args
    }

    /// Arguments for running a single remote command
    pub fn remote_args(&self, remote_cmd: &str) -> Vec<String> {
        let mut args = Self::base_args(self.policy);
        args.extend(self.target.destination_args());
        args.push(remote_cmd.to_string());
        args
    }

    /// Arguments for holding open `local_port -> localhost:remote_port` on the far side
    pub fn forward_args(&self, policy: HostKeyPolicy, local_port: u16, remote_port: u16) -> Vec<String> {
        let mut args = vec![
            "-L".to_string(),
            format!("{}:localhost:{}", local_port, remote_port),
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ];
        args.extend(Self::base_args(policy));
        args.extend(self.target.destination_args());
        args
    }

    /// Process description for a single remote command with captured output
    pub fn remote_command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.remote_args(remote_cmd))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run a remote command and return its stdout
    pub async fn run(&self, remote_cmd: &str) -> Result<String> {
        debug!("Running remote command on {}: {}", self.target, remote_cmd);

        let output = self
            .remote_command(remote_cmd)
            .output()
            .await
            .map_err(|e| Error::RemoteCommand {
                command: remote_cmd.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RemoteCommand {
                command: remote_cmd.to_string(),
                reason: format!("{} ({})", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ForwardLauncher for SshClient {
    fn forward_command(&self, policy: HostKeyPolicy, local_port: u16, remote_port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.forward_args(policy, local_port, remote_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
