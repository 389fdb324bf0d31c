// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Error types for Tunnel Dash

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH config error: {0}")]
    SshConfig(String),

    #[error("Remote command `{command}` failed: {reason}")]
    RemoteCommand { command: String, reason: String },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures of the tunnel lifecycle manager.
///
/// `Spawn` and `FailedImmediately` are the two startup-time classes: the
/// forward could not be launched at all, or it launched and died inside the
/// grace window. Failures after acceptance are never returned from here.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid remote port {0}")]
    InvalidPort(u16),

    #[error("No free local port left for remote port {remote_port}")]
    PortsExhausted { remote_port: u16 },

    #[error("Failed to start tunnel for remote port {remote_port}: {source}")]
    Spawn {
        remote_port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Tunnel for remote port {remote_port} failed immediately: {cause}")]
    FailedImmediately { remote_port: u16, cause: String },
}

impl TunnelError {
    /// Remote port the failed operation was about
    pub fn remote_port(&self) -> u16 {
        match self {
            TunnelError::InvalidPort(port) => *port,
            TunnelError::PortsExhausted { remote_port }
            | TunnelError::Spawn { remote_port, .. }
            | TunnelError::FailedImmediately { remote_port, .. } => *remote_port,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
