// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Nginx Proxy Manager: maps unpublished containers to proxy domains

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use tunnel_dash_common::service::local_url;
use tunnel_dash_common::{Service, ServiceType};

use super::docker::{identify_service, DockerContainer};
use crate::remote::RemoteShell;

/// Preferred proxy ports, most preferred first
const PREFERRED_PROXY_PORTS: [u16; 3] = [443, 80, 81];
const NPM_DATABASE: &str = "/data/database.sqlite";
const DATA_MOUNT_FORMAT: &str =
    r#"'{{range .Mounts}}{{if eq .Destination "/data"}}{{.Source}}{{end}}{{end}}'"#;

static SERVER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"server_name\s+([^;]+);").expect("server_name pattern is valid"));

/// Names that are safe to splice into a remote shell command
fn is_safe_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
}

/// Parse sqlite output of `domain_names` (JSON arrays or comma lists)
pub fn parse_domain_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.contains("exec failed") && !l.contains("executable file not found"))
        .flat_map(|l| l.split(','))
        .map(|d| d.trim_matches(|c: char| c.is_whitespace() || matches!(c, '[' | ']' | '"')))
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract `server_name` values from nginx config text
pub fn parse_server_names(output: &str) -> Vec<String> {
    SERVER_NAME
        .captures_iter(output)
        .flat_map(|caps| {
            caps[1]
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn proxy_host_query(container: &str, port: Option<u16>) -> String {
    let mut query = format!(
        "SELECT domain_names FROM proxy_host WHERE (forward_host LIKE '%{0}%' OR forward_host = '{0}')",
        container
    );
    if let Some(port) = port {
        query.push_str(&format!(" AND forward_port = {}", port));
    }
    query
}

/// The proxy container and the local port its tunnel listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub container: String,
    pub local_port: u16,
}

/// Locate a tunnelled Nginx (Proxy Manager) instance
pub fn find_proxy(
    exposed: &HashMap<u16, DockerContainer>,
    services: &[Service],
    local_ports: &HashMap<u16, u16>,
) -> Option<ProxyEndpoint> {
    let mut nginx_ports: Vec<u16> = exposed
        .iter()
        .filter(|(_, c)| c.is_nginx())
        .map(|(port, _)| *port)
        .collect();
    nginx_ports.sort_unstable();

    let (remote_port, container) = if nginx_ports.is_empty() {
        let svc = services.iter().find(|s| {
            s.service_type == ServiceType::Nginx || s.name.to_lowercase().contains("nginx")
        })?;
        (svc.port?, svc.name.clone())
    } else {
        let port = PREFERRED_PROXY_PORTS
            .iter()
            .copied()
            .find(|p| nginx_ports.contains(p))
            .unwrap_or(nginx_ports[0]);
        (port, exposed[&port].name.clone())
    };

    let local_port = *local_ports.get(&remote_port)?;
    Some(ProxyEndpoint {
        container,
        local_port,
    })
}

/// Looks up proxy domains configured in Nginx Proxy Manager
#[derive(Clone)]
pub struct NpmLookup {
    shell: Arc<dyn RemoteShell>,
}

impl NpmLookup {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    /// Domains proxied to `container[:port]`, trying the NPM database, then the
    /// generated nginx config, then the database through the host-side mount
    pub async fn domains(&self, npm: &str, container: &str, port: Option<u16>) -> Vec<String> {
        if !is_safe_name(npm) || !is_safe_name(container) {
            debug!("Skipping domain lookup for unusual container name {:?}", container);
            return Vec::new();
        }

        let domains = self.from_database(npm, container, port).await;
        if !domains.is_empty() {
            return domains;
        }

        let domains = self.from_config(npm, container, port).await;
        if !domains.is_empty() {
            return domains;
        }

        self.from_host_mount(npm, container, port).await
    }

    async fn from_database(&self, npm: &str, container: &str, port: Option<u16>) -> Vec<String> {
        let command = format!(
            "docker exec {} sqlite3 {} \"{}\" 2>/dev/null || echo ''",
            npm,
            NPM_DATABASE,
            proxy_host_query(container, port)
        );
        match self.shell.run(&command).await {
            Ok(output) => parse_domain_lines(&output),
            Err(e) => {
                debug!("NPM database lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn from_config(&self, npm: &str, container: &str, port: Option<u16>) -> Vec<String> {
        let target = match port {
            Some(port) => format!("{}:{}", container, port),
            None => container.to_string(),
        };
        let command = format!(
            "docker exec {} sh -c \"grep -l '{}' /data/nginx/proxy_host/*.conf 2>/dev/null | head -1 | xargs -r grep -h server_name\" 2>/dev/null || echo ''",
            npm, target
        );
        match self.shell.run(&command).await {
            Ok(output) => parse_server_names(&output),
            Err(e) => {
                debug!("nginx config lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn from_host_mount(&self, npm: &str, container: &str, port: Option<u16>) -> Vec<String> {
        let inspect = format!("docker inspect {} --format {} 2>/dev/null", npm, DATA_MOUNT_FORMAT);
        let mount = match self.shell.run(&inspect).await {
            Ok(output) => output.trim().to_string(),
            Err(e) => {
                debug!("Could not inspect {}: {}", npm, e);
                return Vec::new();
            }
        };

        if !is_safe_name(&mount) {
            return Vec::new();
        }

        let command = format!(
            "sqlite3 {}/database.sqlite \"{}\" 2>/dev/null || echo ''",
            mount,
            proxy_host_query(container, port)
        );
        match self.shell.run(&command).await {
            Ok(output) => parse_domain_lines(&output),
            Err(e) => {
                debug!("Host-side NPM database lookup failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Add services for containers that publish nothing to the host.
///
/// With a proxy they point at the proxy's tunnel (with a domain when one is
/// configured); without one they are listed as internal only.
pub async fn add_unpublished_services(
    services: &mut Vec<Service>,
    containers: &[DockerContainer],
    proxy: Option<&ProxyEndpoint>,
    lookup: &NpmLookup,
) {
    let mut known_ports: HashSet<u16> = services.iter().filter_map(|s| s.port).collect();

    for container in containers {
        let fallback = match container.port {
            None => "No exposed ports - internal network only".to_string(),
            Some(port) if !container.exposed_to_host && !known_ports.contains(&port) => {
                known_ports.insert(port);
                format!("Container port {} - not exposed to host", port)
            }
            Some(_) => continue,
        };

        let mut service = identify_service(container, None);
        service.port = None;

        match proxy {
            Some(proxy) => {
                service.url = Some(local_url("http", proxy.local_port));
                let domains = lookup
                    .domains(&proxy.container, &container.name, container.port)
                    .await;

                match domains.into_iter().next() {
                    Some(domain) => {
                        service.description = format!("{} (Domain: {})", service.description, domain);
                        service.domain = Some(domain);
                    }
                    None => {
                        service.description =
                            format!("{} (Accessible via Nginx Proxy Manager)", service.description);
                    }
                }
            }
            None => {
                service.url = None;
                service.description = format!("{} ({})", service.description, fallback);
            }
        }

        services.push(service);
    }
}
