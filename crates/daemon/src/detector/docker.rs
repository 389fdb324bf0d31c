// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Docker inventory: parses `docker ps` output taken over ssh

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use tunnel_dash_common::service::local_url;
use tunnel_dash_common::{Result, Service, ServiceType};

use crate::remote::RemoteShell;

pub const DOCKER_PS: &str =
    "docker ps --format '{{.Names}}|{{.Image}}|{{.Ports}}|{{.Networks}}'";

/// `[ip:]host->container/tcp`
static PUBLISHED_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d+\.\d+\.\d+\.\d+:)?(\d+)->(\d+)/tcp").expect("published port pattern is valid")
});

/// Bare `port/tcp` (exposed inside the container only)
static CONTAINER_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)/tcp").expect("container port pattern is valid"));

/// One container, or one port of a container that exposes several
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerContainer {
    pub name: String,
    pub image: String,
    /// Host port when published, container port otherwise, `None` without ports
    pub port: Option<u16>,
    /// Raw `Ports` column
    pub port_mapping: String,
    pub network: Option<String>,
    /// Published with `-p`, not just `EXPOSE`d
    pub exposed_to_host: bool,
}

impl DockerContainer {
    pub fn is_nginx(&self) -> bool {
        self.image.to_lowercase().contains("nginx") || self.name.to_lowercase().contains("nginx")
    }
}

fn push_unique(ports: &mut Vec<u16>, port: u16) {
    if port > 0 && !ports.contains(&port) {
        ports.push(port);
    }
}

/// Parse `docker ps --format '{{.Names}}|{{.Image}}|{{.Ports}}|{{.Networks}}'`
pub fn parse_docker_ps(output: &str) -> Vec<DockerContainer> {
    let mut containers = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        if parts.len() < 3 {
            continue;
        }

        let name = parts[0].to_string();
        let image = parts[1].to_string();
        let ports_column = parts[2];
        let network = parts
            .get(3)
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string());

        let mut ports = Vec::new();
        for caps in PUBLISHED_PORT.captures_iter(ports_column) {
            if let Ok(port) = caps[1].parse() {
                push_unique(&mut ports, port);
            }
        }
        let exposed_to_host = !ports.is_empty();

        if !exposed_to_host {
            for caps in CONTAINER_PORT.captures_iter(ports_column) {
                if let Ok(port) = caps[1].parse() {
                    push_unique(&mut ports, port);
                }
            }
        }

        if ports.is_empty() {
            containers.push(DockerContainer {
                name,
                image,
                port: None,
                port_mapping: String::new(),
                network,
                exposed_to_host: false,
            });
            continue;
        }

        for port in ports {
            containers.push(DockerContainer {
                name: name.clone(),
                image: image.clone(),
                port: Some(port),
                port_mapping: ports_column.to_string(),
                network: network.clone(),
                exposed_to_host,
            });
        }
    }

    containers
}

/// Containers published to the host, keyed by host port
pub fn exposed_services(containers: &[DockerContainer]) -> HashMap<u16, DockerContainer> {
    containers
        .iter()
        .filter(|c| c.exposed_to_host)
        .filter_map(|c| c.port.map(|port| (port, c.clone())))
        .collect()
}

fn strip_tag(image: &str) -> &str {
    image.split(':').next().unwrap_or(image)
}

/// Image name for descriptions: drop a `:latest` tag, keep any other
fn display_image(image: &str) -> &str {
    match image.split_once(':') {
        Some((name, "latest")) => name,
        _ => image,
    }
}

/// Guess the service from image and container names.
///
/// `local_port` is where the service is reachable through its tunnel.
pub fn identify_service(container: &DockerContainer, local_port: Option<u16>) -> Service {
    let image = container.image.to_lowercase();
    let name = container.name.to_lowercase();
    let matches = |needle: &str| image.contains(needle) || name.contains(needle);

    let (display, service_type, description) = if matches("grafana") {
        ("Grafana".to_string(), ServiceType::Grafana, format!("Grafana Dashboard ({})", strip_tag(&container.image)))
    } else if matches("prometheus") {
        ("Prometheus".to_string(), ServiceType::Prometheus, format!("Prometheus Metrics Server ({})", strip_tag(&container.image)))
    } else if matches("nginx") {
        ("Nginx".to_string(), ServiceType::Nginx, format!("Nginx Server ({})", container.image))
    } else if matches("postgres") || name.contains("db") {
        ("PostgreSQL".to_string(), ServiceType::Postgres, format!("PostgreSQL Database ({})", container.image))
    } else if matches("redis") {
        ("Redis".to_string(), ServiceType::Redis, format!("Redis Cache ({})", container.image))
    } else if matches("mysql") {
        ("MySQL".to_string(), ServiceType::Mysql, format!("MySQL Database ({})", container.image))
    } else if matches("mongodb") {
        ("MongoDB".to_string(), ServiceType::Mongodb, format!("MongoDB Database ({})", container.image))
    } else if matches("jupyter") {
        ("Jupyter".to_string(), ServiceType::Jupyter, format!("Jupyter Notebook ({})", container.image))
    } else if matches("jenkins") {
        ("Jenkins".to_string(), ServiceType::Jenkins, format!("Jenkins CI/CD ({})", container.image))
    } else if matches("elasticsearch") {
        ("Elasticsearch".to_string(), ServiceType::Elasticsearch, format!("Elasticsearch ({})", container.image))
    } else if matches("kibana") {
        ("Kibana".to_string(), ServiceType::Kibana, format!("Kibana ({})", container.image))
    } else if matches("rabbitmq") {
        ("RabbitMQ".to_string(), ServiceType::Rabbitmq, format!("RabbitMQ ({})", container.image))
    } else if ["app", "api", "service"].iter().any(|n| name.contains(n)) {
        (container.name.clone(), ServiceType::Application, format!("Application Service ({})", container.image))
    } else {
        (
            container.name.clone(),
            ServiceType::Docker,
            format!("Docker container: {} ({})", container.name, display_image(&container.image)),
        )
    };

    Service {
        port: container.port,
        name: display,
        service_type,
        url: local_port.map(|p| local_url("http", p)),
        description,
        domain: None,
        network: container.network.clone(),
    }
}

/// Reads the container inventory from the remote host
#[derive(Clone)]
pub struct DockerInventory {
    shell: Arc<dyn RemoteShell>,
}

impl DockerInventory {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    /// Every running container, including ones without published ports
    pub async fn containers(&self) -> Result<Vec<DockerContainer>> {
        let output = self.shell.run(DOCKER_PS).await?;
        let containers = parse_docker_ps(&output);
        debug!("docker ps reported {} container entries", containers.len());
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeShell;

    const PS_OUTPUT: &str = "\
grafana|grafana/grafana:10.2.0|0.0.0.0:3000->3000/tcp, :::3000->3000/tcp|monitoring
npm|jc21/nginx-proxy-manager:latest|0.0.0.0:80-81->80-81/tcp, 0.0.0.0:443->443/tcp|web,proxy
api-backend|acme/api:1.4|8000/tcp|web
worker|acme/worker:latest||backend
multi|acme/multi|127.0.0.1:5000->5000/tcp, 127.0.0.1:5001->5001/tcp|
broken line without separators
";

    #[test]
    fn test_parse_published_ports() {
        let containers = parse_docker_ps(PS_OUTPUT);
        let grafana: Vec<_> = containers.iter().filter(|c| c.name == "grafana").collect();

        assert_eq!(grafana.len(), 1);
        assert_eq!(grafana[0].port, Some(3000));
        assert!(grafana[0].exposed_to_host);
        assert_eq!(grafana[0].network.as_deref(), Some("monitoring"));
    }

    #[test]
    fn test_parse_container_only_and_portless() {
        let containers = parse_docker_ps(PS_OUTPUT);

        let api = containers.iter().find(|c| c.name == "api-backend").unwrap();
        assert_eq!(api.port, Some(8000));
        assert!(!api.exposed_to_host);

        let worker = containers.iter().find(|c| c.name == "worker").unwrap();
        assert_eq!(worker.port, None);
        assert!(worker.port_mapping.is_empty());
    }

    #[test]
    fn test_parse_multiple_ports_and_skips_garbage() {
        let containers = parse_docker_ps(PS_OUTPUT);

        let multi: Vec<u16> = containers
            .iter()
            .filter(|c| c.name == "multi")
            .filter_map(|c| c.port)
            .collect();
        assert_eq!(multi, vec![5000, 5001]);
        assert!(containers.iter().all(|c| !c.name.starts_with("broken")));
        assert!(containers.iter().find(|c| c.name == "multi").unwrap().network.is_none());
    }

    #[test]
    fn test_exposed_services_only_published() {
        let exposed = exposed_services(&parse_docker_ps(PS_OUTPUT));

        assert!(exposed.contains_key(&3000));
        assert!(exposed.contains_key(&443));
        assert!(exposed.contains_key(&5001));
        assert!(!exposed.contains_key(&8000));
        assert_eq!(exposed[&443].name, "npm");
        assert!(exposed[&443].is_nginx());
    }

    fn container(name: &str, image: &str) -> DockerContainer {
        DockerContainer {
            name: name.to_string(),
            image: image.to_string(),
            port: Some(3000),
            port_mapping: String::new(),
            network: None,
            exposed_to_host: true,
        }
    }

    #[test]
    fn test_identify_known_images() {
        let svc = identify_service(&container("monitoring", "grafana/grafana:10.2.0"), Some(3000));
        assert_eq!(svc.service_type, ServiceType::Grafana);
        assert_eq!(svc.description, "Grafana Dashboard (grafana/grafana)");
        assert_eq!(svc.url.as_deref(), Some("http://localhost:3000"));

        let svc = identify_service(&container("maindb", "custom:1"), None);
        assert_eq!(svc.service_type, ServiceType::Postgres);
        assert_eq!(svc.url, None);

        let svc = identify_service(&container("billing-api", "acme/billing:2"), None);
        assert_eq!(svc.service_type, ServiceType::Application);
        assert_eq!(svc.name, "billing-api");
    }

    #[test]
    fn test_identify_fallback_docker() {
        let svc = identify_service(&container("thing", "acme/thing:latest"), Some(9001));
        assert_eq!(svc.service_type, ServiceType::Docker);
        assert_eq!(svc.description, "Docker container: thing (acme/thing)");

        let svc = identify_service(&container("thing", "acme/thing:1.2"), None);
        assert_eq!(svc.description, "Docker container: thing (acme/thing:1.2)");
    }

    #[tokio::test]
    async fn test_inventory_runs_docker_ps() {
        let shell = Arc::new(FakeShell::new().respond("docker ps", PS_OUTPUT));
        let inventory = DockerInventory::new(shell.clone());

        let containers = inventory.containers().await.unwrap();
        assert!(!containers.is_empty());
        assert_eq!(shell.calls(), vec![DOCKER_PS]);
    }

    #[tokio::test]
    async fn test_inventory_error_propagates() {
        let inventory = DockerInventory::new(Arc::new(FakeShell::new().fail("docker", "docker: not found")));
        assert!(inventory.containers().await.is_err());
    }
}
