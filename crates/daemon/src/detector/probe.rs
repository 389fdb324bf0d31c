// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - HTTP Probe
// Identifies what answers on a tunnelled port from its HTTP response

use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE, SET_COOKIE};
use reqwest::Client;
use tracing::{debug, trace};

use tunnel_dash_common::network::format_host_port;
use tunnel_dash_common::service::local_url;
use tunnel_dash_common::{Result, Service, ServiceType};

/// Only this much of a body is inspected
const MAX_BODY_BYTES: usize = 2048;

/// Tried in order when `/` does not answer
const FALLBACK_PATHS: &[&str] = &[
    "/login",
    "/api/health",
    "/api",
    "/api/v1",
    "/health",
    "/status",
    "/metrics",
    "/graphql",
];

/// What one HTTP response looked like
pub struct ProbeResponse<'a> {
    pub status: u16,
    pub headers: &'a HeaderMap,
    /// Lowercased prefix of the body
    pub body: &'a str,
    pub path: &'a str,
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Classify a response. `remote_port` names the service, `url` is where it is reachable.
pub fn classify_response(response: &ProbeResponse<'_>, remote_port: u16, url: String) -> Service {
    let body = response.body;
    let headers = response.headers;
    let content_type = header(headers, CONTENT_TYPE.as_str());

    let (name, service_type, description) = if let Some(version) = headers
        .get("x-grafana-version")
        .and_then(|v| v.to_str().ok())
    {
        (
            "Grafana".to_string(),
            ServiceType::Grafana,
            format!("Grafana Dashboard (Version: {})", version),
        )
    } else if body.contains("grafana")
        || header(headers, SET_COOKIE.as_str()).to_lowercase().contains("grafana")
    {
        ("Grafana".to_string(), ServiceType::Grafana, "Grafana Dashboard".to_string())
    } else if response.path.contains("/metrics") || (body.contains("# help") && body.contains("# type")) {
        (
            "Prometheus".to_string(),
            ServiceType::Prometheus,
            "Prometheus Metrics Server".to_string(),
        )
    } else if body.contains("kubernetes") || body.contains("k8s") {
        (
            "Kubernetes Dashboard".to_string(),
            ServiceType::Kubernetes,
            "Kubernetes Web Dashboard".to_string(),
        )
    } else if body.contains("jenkins") || headers.contains_key("x-jenkins") {
        ("Jenkins".to_string(), ServiceType::Jenkins, "Jenkins CI/CD Server".to_string())
    } else if body.contains("jupyter") || body.contains("notebook") {
        ("Jupyter".to_string(), ServiceType::Jupyter, "Jupyter Notebook Server".to_string())
    } else if ["react", "vue", "angular"].iter().any(|fw| body.contains(fw)) {
        (
            format!("Web Application (Port {})", remote_port),
            ServiceType::Webapp,
            "Single Page Application".to_string(),
        )
    } else if content_type.contains("application/json") {
        (
            format!("API Service (Port {})", remote_port),
            ServiceType::Api,
            format!("REST API Service (Status: {})", response.status),
        )
    } else if content_type.contains("text/html") {
        (
            format!("Web Service (Port {})", remote_port),
            ServiceType::Web,
            format!("Web Service (Status: {})", response.status),
        )
    } else {
        let content_type = if content_type.is_empty() { "unknown" } else { content_type };
        (
            format!("HTTP Service (Port {})", remote_port),
            ServiceType::Http,
            format!(
                "HTTP Service (Status: {}, Content-Type: {})",
                response.status, content_type
            ),
        )
    };

    Service {
        port: Some(remote_port),
        name,
        service_type,
        url: Some(url),
        description,
        domain: None,
        network: None,
    }
}

/// Well-known port table, used only when probing learned nothing
pub fn guess_by_port(remote_port: u16, local_port: u16) -> Option<Service> {
    let (name, service_type, description) = match remote_port {
        3000 => ("Node.js Dev Server", ServiceType::Webapp, "Common port for Node.js development servers"),
        3001 => ("Alternative Web Service", ServiceType::Web, "Common alternative port for web services"),
        3306 => ("MySQL", ServiceType::Mysql, "Default MySQL port"),
        4000 => ("Development Server", ServiceType::Web, "Common development server port"),
        5000 => ("Flask/Development Server", ServiceType::Web, "Common Flask development port"),
        5001 => ("Flask Alternative", ServiceType::Web, "Alternative Flask port"),
        5432 => ("PostgreSQL", ServiceType::Postgres, "Default PostgreSQL port"),
        5601 => ("Kibana", ServiceType::Kibana, "Default Kibana port"),
        6379 => ("Redis", ServiceType::Redis, "Default Redis port"),
        7000 => ("Development Server", ServiceType::Web, "Common development server port"),
        8000 => ("Python HTTP Server", ServiceType::Web, "Common Python development server port"),
        8001 => ("Python HTTP Alternative", ServiceType::Web, "Alternative Python server port"),
        8080 => ("HTTP Proxy/Web Server", ServiceType::Web, "Common HTTP alternative port"),
        8081 => ("HTTP Alternative", ServiceType::Web, "Common HTTP alternative port"),
        8888 => ("Jupyter Notebook", ServiceType::Jupyter, "Common Jupyter Notebook port"),
        9000 => ("SonarQube/Development", ServiceType::Web, "Common for SonarQube or development servers"),
        9090 => ("Prometheus", ServiceType::Prometheus, "Default Prometheus port"),
        9091 => ("Prometheus Alternative", ServiceType::Prometheus, "Alternative Prometheus port"),
        9200 => ("Elasticsearch", ServiceType::Elasticsearch, "Default Elasticsearch port"),
        15672 => ("RabbitMQ Management", ServiceType::Rabbitmq, "RabbitMQ Management UI"),
        27017 => ("MongoDB", ServiceType::Mongodb, "Default MongoDB port"),
        _ => return None,
    };

    let mut svc = Service::new(remote_port, name, service_type, description);
    svc.url = Some(local_url("http", local_port));
    Some(svc)
}

/// Probes tunnelled ports over HTTP and HTTPS
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
    host: String,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Services behind the bastion commonly use self-signed certificates
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            host: "localhost".to_string(),
        })
    }

    /// Connect to `host` instead of localhost; the reported URLs keep localhost
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Identify the service behind `local_port`, which forwards to `remote_port`
    pub async fn probe(&self, remote_port: u16, local_port: u16) -> Service {
        if let Some(svc) = self.probe_http(remote_port, local_port).await {
            return svc;
        }

        guess_by_port(remote_port, local_port)
            .unwrap_or_else(|| unreachable_service(remote_port, local_port))
    }

    /// HTTP then HTTPS; `None` when neither answers
    pub async fn probe_http(&self, remote_port: u16, local_port: u16) -> Option<Service> {
        let plain = match self.try_scheme("http", remote_port, local_port).await {
            Some(svc) if svc.service_type.is_specific() => return Some(svc),
            other => other,
        };

        let tls = match self.try_scheme("https", remote_port, local_port).await {
            Some(svc) if svc.service_type.is_specific() => return Some(svc),
            other => other,
        };

        plain.or(tls)
    }

    async fn try_scheme(&self, scheme: &str, remote_port: u16, local_port: u16) -> Option<Service> {
        let base = format!("{}://{}", scheme, format_host_port(&self.host, local_port));

        match self.fetch(&base, "/").await {
            Some(found) => Some(found.into_service(remote_port, local_url(scheme, local_port))),
            None => {
                for path in FALLBACK_PATHS {
                    if let Some(found) = self.fetch(&base, path).await {
                        if found.status < 500 {
                            return Some(found.into_service(remote_port, local_url(scheme, local_port)));
                        }
                    }
                }
                None
            }
        }
    }

    async fn fetch(&self, base: &str, path: &str) -> Option<Fetched> {
        let url = format!("{}{}", base, path);
        let mut response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                trace!("Probe of {} failed: {}", url, e);
                return None;
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let mut body = Vec::new();
        while body.len() < MAX_BODY_BYTES {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                _ => break,
            }
        }
        body.truncate(MAX_BODY_BYTES);

        debug!("Probe of {} answered {}", url, status);
        Some(Fetched {
            status,
            headers,
            body: String::from_utf8_lossy(&body).to_lowercase(),
            path: path.to_string(),
        })
    }
}

struct Fetched {
    status: u16,
    headers: HeaderMap,
    body: String,
    path: String,
}

impl Fetched {
    fn into_service(self, remote_port: u16, url: String) -> Service {
        let response = ProbeResponse {
            status: self.status,
            headers: &self.headers,
            body: &self.body,
            path: &self.path,
        };
        classify_response(&response, remote_port, url)
    }
}

fn unreachable_service(remote_port: u16, local_port: u16) -> Service {
    let mut svc = Service::unknown(remote_port, "Unknown service - may require manual inspection");
    svc.url = Some(local_url("http", local_port));
    svc
}
