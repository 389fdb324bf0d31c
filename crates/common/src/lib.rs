// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Common Library
// Shared types, ssh command building, service model and dashboard rendering

pub mod dashboard;
pub mod error;
pub mod network;
pub mod service;
pub mod ssh;
pub mod ssh_config;
pub mod types;

pub use dashboard::{render_cli, render_html, AccessLevel, DashboardStats, ServiceView, ViewModel};
pub use error::{Error, Result, TunnelError};
pub use network::{is_loopback_address, PortRange};
pub use service::{Service, ServiceType};
pub use ssh::{ForwardLauncher, HostKeyPolicy, SshClient, SshTarget};
pub use ssh_config::HostConfig;
pub use types::{
    DetectionMode, HealthResponse, ScanResponse, TunnelEvent, TunnelInfo, TunnelState,
    TunnelStatusResponse,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
