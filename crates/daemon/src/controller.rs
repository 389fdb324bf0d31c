// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Controller
// Resolves the target, finds remote ports, opens tunnels and identifies services

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_dash_common::ssh_config;
use tunnel_dash_common::{
    DetectionMode, ForwardLauncher, HostConfig, PortRange, Service, SshClient, SshTarget,
};

use crate::config::DaemonConfig;
use crate::detector::{
    add_unpublished_services, exposed_services, find_proxy, DockerContainer, DockerInventory,
    HttpProber, NpmLookup, ServiceDetector, Target,
};
use crate::remote::RemoteShell;
use crate::scanner::PortScanner;
use crate::tunnel::{TunnelManager, TunnelSettings};

/// How the user named the remote host on the command line
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// `Host` alias from the ssh config
    pub host: Option<String>,
    pub server: Option<String>,
    pub user: Option<String>,
    /// Identity file; overrides the one from the ssh config
    pub key: Option<PathBuf>,
}

fn fallback_user() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|user| !user.is_empty())
        .unwrap_or_else(|| "root".to_string())
}

/// Turn command-line connection options into an ssh target.
///
/// An alias stays an alias so ssh applies its whole config block; an explicit
/// `--key` is passed with `-i` on top of it.
pub fn resolve_target(options: &ConnectionOptions, ssh_config_path: Option<&Path>) -> Result<SshTarget> {
    if let Some(alias) = options.host.as_deref() {
        let resolved = match ssh_config_path {
            Some(path) => ssh_config::resolve_host_from(path, alias),
            None => ssh_config::resolve_host(alias),
        };

        let host_config = match resolved {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; ssh will resolve '{}' on its own", e, alias);
                HostConfig {
                    host: alias.to_string(),
                    host_name: alias.to_string(),
                    user: None,
                    identity_file: None,
                    port: 22,
                }
            }
        };

        info!(
            "Host '{}' resolves to {}:{}",
            alias, host_config.host_name, host_config.port
        );

        return Ok(match options.key.clone() {
            Some(key) => SshTarget::explicit(
                alias,
                options
                    .user
                    .clone()
                    .or(host_config.user)
                    .unwrap_or_else(fallback_user),
                Some(key),
            ),
            None => SshTarget::alias(alias),
        });
    }

    match (options.server.as_deref(), options.user.as_deref()) {
        (Some(server), Some(user)) => Ok(SshTarget::explicit(server, user, options.key.clone())),
        _ => anyhow::bail!("Either --host or both --server and --user are required"),
    }
}

/// Ports to forward plus whatever the Docker inventory returned
#[derive(Debug, Default)]
struct Discovery {
    ports: Vec<u16>,
    containers: Vec<DockerContainer>,
}

/// Runs one discovery pass against a remote host
pub struct Controller {
    manager: TunnelManager,
    scanner: PortScanner,
    inventory: DockerInventory,
    detector: ServiceDetector,
    npm: NpmLookup,
    mode: DetectionMode,
    scan_range: PortRange,
    stabilize_delay: std::time::Duration,
}

impl Controller {
    /// Build a controller that talks to the remote host through `client`
    pub fn new(client: SshClient, config: &DaemonConfig) -> Result<Self> {
        let client = Arc::new(client);
        Self::with_parts(client.clone(), client, config)
    }

    /// Build a controller from explicit remote-command and forward seams
    pub fn with_parts(
        shell: Arc<dyn RemoteShell>,
        launcher: Arc<dyn ForwardLauncher>,
        config: &DaemonConfig,
    ) -> Result<Self> {
        let settings = TunnelSettings {
            start_port: config.tunnel_start_port,
            grace_window: config.grace_window(),
            ..Default::default()
        };
        let prober = HttpProber::new(config.probe_timeout())
            .context("Failed to build HTTP prober")?
            .with_host(&config.probe_host);

        Ok(Self {
            manager: TunnelManager::new(launcher, settings),
            scanner: PortScanner::new(shell.clone()),
            inventory: DockerInventory::new(shell.clone()),
            detector: ServiceDetector::new(prober),
            npm: NpmLookup::new(shell),
            mode: config.detection_mode,
            scan_range: PortRange::parse_lenient(&config.scan_ports),
            stabilize_delay: config.stabilize_delay(),
        })
    }

    pub fn tunnel_manager(&self) -> &TunnelManager {
        &self.manager
    }

    pub fn scanner(&self) -> &PortScanner {
        &self.scanner
    }

    async fn collect_ports(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();

        if self.mode.uses_docker() {
            match self.inventory.containers().await {
                Ok(containers) => {
                    let mut ports: Vec<u16> = exposed_services(&containers).into_keys().collect();
                    ports.sort_unstable();
                    info!("Docker reports {} published port(s)", ports.len());
                    discovery.ports = ports;
                    discovery.containers = containers;
                }
                Err(e) if self.mode == DetectionMode::Docker => {
                    return Err(e).context("Failed to list Docker containers");
                }
                Err(e) => warn!("Docker inventory unavailable: {}", e),
            }
        }

        if self.mode.uses_direct() && discovery.ports.is_empty() {
            discovery.ports = self
                .scanner
                .scan(self.scan_range)
                .await
                .context("Failed to scan remote ports")?;
            info!(
                "Found {} listening port(s) in {}",
                discovery.ports.len(),
                self.scan_range
            );
        }

        Ok(discovery)
    }

    /// Open a forward per port; individual failures are reported and skipped
    async fn open_tunnels(&self, ports: &[u16]) -> Result<Vec<Target>> {
        let mut targets = Vec::with_capacity(ports.len());

        for &remote_port in ports {
            match self.manager.create_tunnel(remote_port).await {
                Ok(local_port) => {
                    println!(
                        "  {} {} -> localhost:{}",
                        "✓".green(),
                        remote_port,
                        local_port
                    );
                    targets.push((remote_port, local_port));
                }
                Err(e) => {
                    println!("  {} {}: {}", "✗".red(), remote_port, e);
                    warn!("Skipping port {}: {}", remote_port, e);
                }
            }
        }

        if targets.is_empty() {
            anyhow::bail!("No tunnels could be established ({} port(s) tried)", ports.len());
        }

        Ok(targets)
    }

    /// Find ports, open tunnels and identify what runs behind them
    pub async fn discover(&self) -> Result<Vec<Service>> {
        let discovery = self.collect_ports().await?;
        if discovery.ports.is_empty() {
            anyhow::bail!("No ports found on the remote host");
        }

        println!("{}", "Creating tunnels...".bold());
        let targets = self.open_tunnels(&discovery.ports).await?;

        if !self.stabilize_delay.is_zero() {
            debug!("Waiting {:?} for tunnels to settle", self.stabilize_delay);
            tokio::time::sleep(self.stabilize_delay).await;
        }

        let exposed = exposed_services(&discovery.containers);
        let mut services = match self.mode {
            DetectionMode::Docker => self.detector.detect_from_docker(&targets, &exposed),
            _ => self.detector.detect_services(&targets, &exposed).await,
        };

        if !discovery.containers.is_empty() {
            let local_ports: HashMap<u16, u16> = targets.iter().copied().collect();
            let proxy = find_proxy(&exposed, &services, &local_ports);
            if let Some(proxy) = &proxy {
                info!(
                    "Nginx proxy '{}' reachable on local port {}",
                    proxy.container, proxy.local_port
                );
            }
            add_unpublished_services(&mut services, &discovery.containers, proxy.as_ref(), &self.npm)
                .await;
        }

        info!("Detected {} service(s)", services.len());
        Ok(services)
    }

    /// [`Self::discover`], abandoned as soon as `shutdown` is cancelled.
    ///
    /// Every tunnel opened so far is closed when discovery fails or is
    /// interrupted. Returns `None` on interruption.
    pub async fn discover_until(&self, shutdown: &CancellationToken) -> Result<Option<Vec<Service>>> {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.discover() => Some(result),
        };

        match outcome {
            Some(Ok(services)) => Ok(Some(services)),
            Some(Err(e)) => {
                self.manager.close_all().await;
                Err(e)
            }
            None => {
                info!("Discovery interrupted, closing tunnels");
                self.manager.close_all().await;
                Ok(None)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::remote::fake::FakeShell;
    use axum::{response::IntoResponse, routing::get, Router};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::process::Command;
    use tunnel_dash_common::{HostKeyPolicy, ServiceType};

    /// Forwards that stay up (or exit at once) without touching the network
    struct ShellLauncher(&'static str);

    impl ForwardLauncher for ShellLauncher {
        fn forward_command(&self, _policy: HostKeyPolicy, _local: u16, _remote: u16) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(self.0).kill_on_drop(true);
            cmd
        }
    }

    fn test_config(mode: DetectionMode) -> DaemonConfig {
        DaemonConfig {
            detection_mode: mode,
            grace_window_ms: 100,
            stabilize_delay_ms: 0,
            probe_timeout_ms: 300,
            ..Default::default()
        }
    }

    const PS_OUTPUT: &str = "\
cache|redis:7|0.0.0.0:26379->6379/tcp|backend
worker|acme/worker:latest||backend
";

    #[test]
    fn test_resolve_explicit_target() {
        let options = ConnectionOptions {
            server: Some("10.0.0.5".to_string()),
            user: Some("deploy".to_string()),
            ..Default::default()
        };
        let target = resolve_target(&options, None).unwrap();
        assert_eq!(target, SshTarget::explicit("10.0.0.5", "deploy", None));
    }

    #[test]
    fn test_resolve_requires_host_or_server_and_user() {
        let options = ConnectionOptions {
            server: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        assert!(resolve_target(&options, None).is_err());
    }

    #[test]
    fn test_resolve_alias_keeps_alias() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Host prod\n  HostName 10.1.2.3\n  User ops").unwrap();

        let options = ConnectionOptions {
            host: Some("prod".to_string()),
            ..Default::default()
        };
        let target = resolve_target(&options, Some(file.path())).unwrap();
        assert_eq!(target, SshTarget::alias("prod"));
    }

    #[test]
    fn test_resolve_alias_with_key_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Host prod\n  HostName 10.1.2.3\n  User ops").unwrap();

        let options = ConnectionOptions {
            host: Some("prod".to_string()),
            key: Some(PathBuf::from("/keys/prod")),
            ..Default::default()
        };
        let target = resolve_target(&options, Some(file.path())).unwrap();
        assert_eq!(
            target,
            SshTarget::explicit("prod", "ops", Some(PathBuf::from("/keys/prod")))
        );
    }

    #[tokio::test]
    async fn test_discover_docker_mode() {
        let shell = Arc::new(FakeShell::new().respond("docker ps", PS_OUTPUT));
        let controller = Controller::with_parts(
            shell,
            Arc::new(ShellLauncher("exec sleep 30")),
            &test_config(DetectionMode::Docker),
        )
        .unwrap();

        let services = controller.discover().await.unwrap();

        let cache = services.iter().find(|s| s.name == "Redis").unwrap();
        assert_eq!(cache.port, Some(26379));
        assert_eq!(cache.url.as_deref(), Some("http://localhost:26379"));

        let worker = services.iter().find(|s| s.name == "worker").unwrap();
        assert!(worker.description.contains("internal network only"));

        assert_eq!(controller.tunnel_manager().local_port(26379).await, Some(26379));
        controller.tunnel_manager().close_all().await;
    }

    #[tokio::test]
    async fn test_both_mode_falls_back_to_scan() {
        let shell = Arc::new(
            FakeShell::new()
                .respond("docker ps", "")
                .respond("ss", "LISTEN 0 128 0.0.0.0:5432 0.0.0.0:* \n"),
        );
        let controller = Controller::with_parts(
            shell.clone(),
            Arc::new(ShellLauncher("exec sleep 30")),
            &test_config(DetectionMode::Both),
        )
        .unwrap();

        let services = controller.discover().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_type, ServiceType::Postgres);
        assert!(shell.calls().iter().any(|c| c == "ss -tlnp"));

        controller.tunnel_manager().close_all().await;
    }

    #[tokio::test]
    async fn test_discover_fails_when_no_tunnel_survives() {
        let shell = Arc::new(FakeShell::new().respond("docker ps", PS_OUTPUT));
        let controller = Controller::with_parts(
            shell,
            Arc::new(ShellLauncher("echo 'bind: Address already in use' >&2; exit 255")),
            &test_config(DetectionMode::Docker),
        )
        .unwrap();

        let err = controller.discover().await.unwrap_err();
        assert!(err.to_string().contains("No tunnels could be established"));
        assert!(controller.tunnel_manager().list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_probe_host_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route(
            "/",
            get(|| async { ([("x-grafana-version", "11.0.0")], "ok").into_response() }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // The remote port is reused locally, so the probe lands on the listener above
        let shell = Arc::new(
            FakeShell::new().respond("ss", &format!("LISTEN 0 128 0.0.0.0:{} 0.0.0.0:* \n", port)),
        );
        let config = DaemonConfig {
            scan_ports: String::new(),
            probe_host: "127.0.0.1".to_string(),
            ..test_config(DetectionMode::Direct)
        };
        let controller =
            Controller::with_parts(shell, Arc::new(ShellLauncher("exec sleep 30")), &config).unwrap();

        let services = controller.discover().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_type, ServiceType::Grafana);
        assert_eq!(services[0].url, Some(format!("http://localhost:{}", port)));

        controller.tunnel_manager().close_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_discovery_closes_tunnels() {
        let shell = Arc::new(FakeShell::new().respond(
            "ss",
            "LISTEN 0 128 0.0.0.0:3000 0.0.0.0:* \nLISTEN 0 128 0.0.0.0:3001 0.0.0.0:* \n",
        ));
        let config = DaemonConfig {
            stabilize_delay_ms: 30_000,
            ..test_config(DetectionMode::Direct)
        };
        let controller =
            Controller::with_parts(shell, Arc::new(ShellLauncher("exec sleep 30")), &config).unwrap();

        let shutdown = CancellationToken::new();
        let canceller = {
            let manager = controller.tunnel_manager().clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                // Interrupt once both forwards are up and discovery is waiting to probe
                while manager.list_tunnels().await.len() < 2 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                shutdown.cancel();
            })
        };

        let outcome = tokio::time::timeout(Duration::from_secs(5), controller.discover_until(&shutdown))
            .await
            .expect("discovery ignored shutdown")
            .unwrap();
        canceller.await.unwrap();

        assert!(outcome.is_none());
        assert!(controller.tunnel_manager().list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_discovery_closes_tunnels() {
        let shell = Arc::new(FakeShell::new().fail("docker", "docker: command not found"));
        let controller = Controller::with_parts(
            shell,
            Arc::new(ShellLauncher("exec sleep 30")),
            &test_config(DetectionMode::Docker),
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        assert!(controller.discover_until(&shutdown).await.is_err());
        assert!(controller.tunnel_manager().list_tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_docker_mode_requires_docker() {
        let shell = Arc::new(FakeShell::new().fail("docker", "docker: command not found"));
        let controller = Controller::with_parts(
            shell,
            Arc::new(ShellLauncher("exec sleep 30")),
            &test_config(DetectionMode::Docker),
        )
        .unwrap();

        assert!(controller.discover().await.is_err());
    }
}
