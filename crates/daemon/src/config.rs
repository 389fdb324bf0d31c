// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Daemon Config Module
// Persistent defaults for the dashboard daemon; command-line flags override them

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use tunnel_dash_common::network::{format_host_port, is_user_port};
use tunnel_dash_common::{is_loopback_address, DetectionMode, PortRange};

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DaemonConfig {
    /// Address the dashboard listens on; loopback only
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    /// First local port handed out when a remote port can't be reused
    #[serde(default = "default_tunnel_start_port")]
    pub tunnel_start_port: u16,

    /// Remote ports to look for ("3000-9000", "8080" or "" for all)
    #[serde(default = "default_scan_ports")]
    pub scan_ports: String,

    #[serde(default)]
    pub detection_mode: DetectionMode,

    /// How long a forward must survive before it counts as established
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    /// Pause between opening tunnels and probing them
    #[serde(default = "default_stabilize_delay_ms")]
    pub stabilize_delay_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Local address the HTTP probes connect to; loopback only
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    /// ssh executable used for forwards and remote commands
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    8080
}

fn default_tunnel_start_port() -> u16 {
    9000
}

fn default_scan_ports() -> String {
    "3000-9000".to_string()
}

fn default_grace_window_ms() -> u64 {
    500
}

fn default_stabilize_delay_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_probe_host() -> String {
    "localhost".to_string()
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            dashboard_port: default_dashboard_port(),
            tunnel_start_port: default_tunnel_start_port(),
            scan_ports: default_scan_ports(),
            detection_mode: DetectionMode::default(),
            grace_window_ms: default_grace_window_ms(),
            stabilize_delay_ms: default_stabilize_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_host: default_probe_host(),
            ssh_program: default_ssh_program(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        // The dashboard lists internal services and has no authentication
        if !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Security violation: the dashboard may only bind to a loopback address (bind_host: {}).\n\
                 Use 127.0.0.1, ::1 or localhost, and reach it remotely through an SSH tunnel.",
                self.bind_host
            );
        }

        if !is_loopback_address(&self.probe_host) {
            anyhow::bail!(
                "probe_host must be a loopback address (got {})",
                self.probe_host
            );
        }

        if !is_user_port(self.tunnel_start_port) {
            anyhow::bail!(
                "tunnel_start_port must be at least 1024 (got {})",
                self.tunnel_start_port
            );
        }

        if PortRange::parse(&self.scan_ports).is_none() {
            anyhow::bail!(
                "Invalid scan_ports '{}': expected \"start-end\", a single port, or empty",
                self.scan_ports
            );
        }

        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn stabilize_delay(&self) -> Duration {
        Duration::from_millis(self.stabilize_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `host:port` the dashboard binds to
    pub fn bind_address(&self) -> String {
        format_host_port(&self.bind_host, self.dashboard_port)
    }

    /// Load daemon configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, writing defaults there on first run
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", path.display());
        Ok(config)
    }

    /// Save daemon configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(path, contents)
            .context("Failed to write daemon configuration")?;

        // Set restrictive permissions on config file (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnel-dash").join("daemon.toml"))
    }
}
