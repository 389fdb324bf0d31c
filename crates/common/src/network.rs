// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Network utility functions

use std::net::IpAddr;

/// Lowest port a tunnel may reuse as its own local port
pub const MIN_USER_PORT: u16 = 1024;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts count as non-loopback
    false
}

/// Format a host and port for use in a socket address or URL, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whether a port lies in the unprivileged range a forward may bind without extra rights
pub fn is_user_port(port: u16) -> bool {
    port >= MIN_USER_PORT
}

/// Inclusive range of TCP ports, as written on the command line ("3000-9000" or "8080")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange { start: 1, end: 65535 };

    /// Parse a range expression. An empty string means every port.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Some(Self::ALL);
        }

        let range = match spec.split_once('-') {
            Some((start, end)) => PortRange {
                start: start.trim().parse().ok()?,
                end: end.trim().parse().ok()?,
            },
            None => {
                let port = spec.parse().ok()?;
                PortRange { start: port, end: port }
            }
        };

        (range.start <= range.end).then_some(range)
    }

    /// Parse a range expression, falling back to every port on malformed input
    pub fn parse_lenient(spec: &str) -> Self {
        Self::parse(spec).unwrap_or(Self::ALL)
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}
