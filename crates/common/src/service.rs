// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Detected service model shared by the daemon, the dashboard and the CLI

use serde::{Deserialize, Serialize};

/// What kind of software answers on a port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Grafana,
    Prometheus,
    Kubernetes,
    Jenkins,
    Jupyter,
    Webapp,
    Api,
    Web,
    Http,
    Nginx,
    Postgres,
    Redis,
    Mysql,
    Mongodb,
    Elasticsearch,
    Kibana,
    Rabbitmq,
    Application,
    Docker,
    Unknown,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Grafana => "grafana",
            ServiceType::Prometheus => "prometheus",
            ServiceType::Kubernetes => "kubernetes",
            ServiceType::Jenkins => "jenkins",
            ServiceType::Jupyter => "jupyter",
            ServiceType::Webapp => "webapp",
            ServiceType::Api => "api",
            ServiceType::Web => "web",
            ServiceType::Http => "http",
            ServiceType::Nginx => "nginx",
            ServiceType::Postgres => "postgres",
            ServiceType::Redis => "redis",
            ServiceType::Mysql => "mysql",
            ServiceType::Mongodb => "mongodb",
            ServiceType::Elasticsearch => "elasticsearch",
            ServiceType::Kibana => "kibana",
            ServiceType::Rabbitmq => "rabbitmq",
            ServiceType::Application => "application",
            ServiceType::Docker => "docker",
            ServiceType::Unknown => "unknown",
        }
    }

    /// Whether probing identified something more precise than "some HTTP server"
    pub fn is_specific(&self) -> bool {
        !matches!(self, ServiceType::Unknown | ServiceType::Http)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service found on the remote host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    /// Remote port, absent for containers that publish nothing to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub description: String,
    /// Public domain when served through Nginx Proxy Manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Docker network(s), comma separated as reported by `docker ps`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl Service {
    pub fn new(
        port: u16,
        name: impl Into<String>,
        service_type: ServiceType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            port: Some(port),
            name: name.into(),
            service_type,
            url: Some(local_url("http", port)),
            description: description.into(),
            domain: None,
            network: None,
        }
    }

    /// Placeholder for a port nothing could be learned about
    pub fn unknown(port: u16, description: impl Into<String>) -> Self {
        Self::new(
            port,
            format!("Service on port {}", port),
            ServiceType::Unknown,
            description,
        )
    }

    /// Whether the service is reached through a reverse proxy rather than its own tunnel
    pub fn is_proxied(&self) -> bool {
        self.domain.is_some() || self.description.contains("Nginx Proxy")
    }
}

/// URL of a port on the local end of a tunnel
pub fn local_url(scheme: &str, port: u16) -> String {
    format!("{}://localhost:{}", scheme, port)
}
