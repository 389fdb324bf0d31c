// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Port Scanner
// Lists listening TCP ports on the remote host via ss, or netstat when ss is missing

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use tunnel_dash_common::{Error, PortRange, Result};

use crate::remote::RemoteShell;

static LISTEN_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":(\d+)\s").expect("listen port pattern is valid"));

/// Extract listening ports from `ss -tlnp` or `netstat -tlnp` output
pub fn parse_listening_ports(output: &str, range: PortRange) -> Vec<u16> {
    let mut seen = HashSet::new();

    output
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| LISTEN_PORT.captures(line))
        .filter_map(|caps| caps[1].parse::<u16>().ok())
        .filter(|port| range.contains(*port))
        .filter(|port| seen.insert(*port))
        .collect()
}

/// Finds listening ports on the remote host
#[derive(Clone)]
pub struct PortScanner {
    shell: Arc<dyn RemoteShell>,
}

impl PortScanner {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    /// Scan using a range expression; malformed ranges scan every port
    pub async fn scan_ports(&self, range: &str) -> Result<Vec<u16>> {
        self.scan(PortRange::parse_lenient(range)).await
    }

    pub async fn scan(&self, range: PortRange) -> Result<Vec<u16>> {
        let output = match self.shell.run("ss -tlnp").await {
            Ok(output) => output,
            Err(ss_err) => {
                debug!("ss failed ({}), falling back to netstat", ss_err);
                self.shell.run("netstat -tlnp").await.map_err(|e| {
                    warn!("Port scan failed: {}", e);
                    Error::RemoteCommand {
                        command: "ss -tlnp / netstat -tlnp".to_string(),
                        reason: format!("failed to scan ports: {}", e),
                    }
                })?
            }
        };

        let ports = parse_listening_ports(&output, range);
        debug!("Scan of {} found {} port(s)", range, ports.len());
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeShell;

    const SS_OUTPUT: &str = "\
State  Recv-Q Send-Q Local Address:Port  Peer Address:Port Process
LISTEN 0      4096       127.0.0.1:3000       0.0.0.0:*     users:((\"grafana\",pid=812,fd=9))
LISTEN 0      511          0.0.0.0:8080       0.0.0.0:*     users:((\"nginx\",pid=77,fd=6))
LISTEN 0      128          0.0.0.0:22         0.0.0.0:*     users:((\"sshd\",pid=1,fd=3))
LISTEN 0      511             [::]:8080          [::]:*     users:((\"nginx\",pid=77,fd=7))
ESTAB  0      0          10.0.0.5:22       10.0.0.9:5122
";

    const NETSTAT_OUTPUT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:9090            0.0.0.0:*               LISTEN      1201/prometheus
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN      900/postgres
tcp6       0      0 :::9090                 :::*                    LISTEN      1201/prometheus
";

    #[test]
    fn test_parse_ss_output() {
        let range = PortRange { start: 3000, end: 9000 };
        assert_eq!(parse_listening_ports(SS_OUTPUT, range), vec![3000, 8080]);
    }

    #[test]
    fn test_parse_full_range_keeps_order() {
        assert_eq!(
            parse_listening_ports(SS_OUTPUT, PortRange::ALL),
            vec![3000, 8080, 22]
        );
    }

    #[test]
    fn test_parse_netstat_output() {
        assert_eq!(
            parse_listening_ports(NETSTAT_OUTPUT, PortRange::ALL),
            vec![9090, 5432]
        );
    }

    #[test]
    fn test_parse_ignores_non_listen_lines() {
        assert!(parse_listening_ports("ESTAB 0 0 1.2.3.4:443 5.6.7.8:999 \n", PortRange::ALL).is_empty());
        assert!(parse_listening_ports("", PortRange::ALL).is_empty());
    }

    #[tokio::test]
    async fn test_scan_prefers_ss() {
        let shell = Arc::new(FakeShell::new().respond("ss", SS_OUTPUT));
        let scanner = PortScanner::new(shell.clone());

        let ports = scanner.scan_ports("3000-9000").await.unwrap();
        assert_eq!(ports, vec![3000, 8080]);
        assert_eq!(shell.calls(), vec!["ss -tlnp"]);
    }

    #[tokio::test]
    async fn test_scan_falls_back_to_netstat() {
        let shell = Arc::new(
            FakeShell::new()
                .fail("ss", "command not found")
                .respond("netstat", NETSTAT_OUTPUT),
        );
        let scanner = PortScanner::new(shell.clone());

        let ports = scanner.scan_ports("garbage").await.unwrap();
        assert_eq!(ports, vec![9090, 5432]);
        assert_eq!(shell.calls(), vec!["ss -tlnp", "netstat -tlnp"]);
    }

    #[tokio::test]
    async fn test_scan_fails_when_both_tools_fail() {
        let scanner = PortScanner::new(Arc::new(FakeShell::new()));
        let err = scanner.scan_ports("").await.unwrap_err();
        assert!(err.to_string().contains("failed to scan ports"));
    }
}
