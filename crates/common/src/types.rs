// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Common types for Tunnel Dash

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Active, // survived the grace window and still running
    Failed, // process exited without being asked to
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelState::Active => "active",
            TunnelState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of one entry in the tunnel table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub remote_port: u16,
    pub local_port: u16,
    pub state: TunnelState,
    pub created_at: DateTime<Utc>,
    /// Failure reason, once the supervisor has reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Events emitted by the tunnel manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    Starting {
        remote_port: u16,
        local_port: u16,
    },
    Active {
        remote_port: u16,
        local_port: u16,
    },
    Failed {
        remote_port: u16,
        local_port: u16,
        reason: String,
    },
    Closed {
        remote_port: u16,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

/// Which sources the controller uses to find remote ports
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// `docker ps` on the remote host only
    Docker,
    /// Listening sockets (`ss`/`netstat`) only
    Direct,
    /// Docker first, listening sockets when Docker finds nothing
    #[default]
    Both,
}

impl DetectionMode {
    pub fn uses_docker(&self) -> bool {
        matches!(self, DetectionMode::Docker | DetectionMode::Both)
    }

    pub fn uses_direct(&self) -> bool {
        matches!(self, DetectionMode::Direct | DetectionMode::Both)
    }
}

impl std::str::FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(DetectionMode::Docker),
            "direct" => Ok(DetectionMode::Direct),
            "both" => Ok(DetectionMode::Both),
            other => Err(format!(
                "unknown detection mode '{}' (expected docker, direct or both)",
                other
            )),
        }
    }
}

/// Body returned by the scan endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScanResponse {
    Ports { ports: Vec<u16>, count: usize },
    Error { error: String },
}

/// Body returned by the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: usize,
}

/// Tunnel entry as served by the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatusResponse {
    #[serde(flatten)]
    pub info: TunnelInfo,
    pub healthy: bool,
}
