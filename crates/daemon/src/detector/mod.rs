// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Service Detection
// Combines the Docker inventory with HTTP probes over the tunnels

pub mod docker;
pub mod nginx;
pub mod probe;

use std::collections::HashMap;

use futures::future::join_all;
use tracing::debug;

use tunnel_dash_common::service::local_url;
use tunnel_dash_common::Service;

pub use docker::{exposed_services, identify_service, DockerContainer, DockerInventory};
pub use nginx::{add_unpublished_services, find_proxy, NpmLookup};
pub use probe::HttpProber;

/// A forwarded port: (remote port, local tunnel port)
pub type Target = (u16, u16);

#[derive(Clone)]
pub struct ServiceDetector {
    prober: HttpProber,
}

impl ServiceDetector {
    pub fn new(prober: HttpProber) -> Self {
        Self { prober }
    }

    /// Identify every target, probing all of them concurrently.
    ///
    /// A Docker match is the baseline; a specific HTTP classification
    /// replaces its type and description but keeps the container name.
    /// The well-known-port table only applies to ports Docker doesn't know.
    pub async fn detect_services(
        &self,
        targets: &[Target],
        docker: &HashMap<u16, DockerContainer>,
    ) -> Vec<Service> {
        let probes = targets.iter().map(|&(remote, local)| async move {
            match docker.get(&remote) {
                Some(container) => {
                    let identified = identify_service(container, Some(local));
                    match self.prober.probe_http(remote, local).await {
                        Some(probed) => merge(identified, probed),
                        None => identified,
                    }
                }
                None => self.prober.probe(remote, local).await,
            }
        });

        join_all(probes).await
    }

    /// Docker-only identification, no HTTP traffic
    pub fn detect_from_docker(
        &self,
        targets: &[Target],
        docker: &HashMap<u16, DockerContainer>,
    ) -> Vec<Service> {
        targets
            .iter()
            .map(|&(remote, local)| match docker.get(&remote) {
                Some(container) => identify_service(container, Some(local)),
                None => {
                    let mut svc =
                        Service::unknown(remote, "No Docker container found for this port");
                    svc.url = Some(local_url("http", local));
                    svc
                }
            })
            .collect()
    }
}

fn merge(mut from_docker: Service, probed: Service) -> Service {
    if probed.service_type.is_specific() {
        debug!(
            "HTTP probe refined {} from {} to {}",
            from_docker.name, from_docker.service_type, probed.service_type
        );
        from_docker.service_type = probed.service_type;
        from_docker.description = probed.description;
        from_docker.url = probed.url.or(from_docker.url);
    }
    from_docker
}
