// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Daemon
// Forwards every service on a remote host and serves a dashboard for them

mod api;
mod config;
mod controller;
mod detector;
mod remote;
mod scanner;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_dash_common::{
    render_cli, DetectionMode, HostKeyPolicy, SshClient, TunnelEvent, ViewModel,
};

use api::{create_router, AppState};
use config::DaemonConfig;
use controller::{resolve_target, ConnectionOptions, Controller};

#[derive(Parser, Debug)]
#[command(name = "tunnel-dash")]
#[command(about = "Tunnel every service on a remote host and list them on a local dashboard")]
#[command(version)]
struct Args {
    /// Host alias from ~/.ssh/config
    #[arg(long)]
    host: Option<String>,

    /// Remote server address (with --user)
    #[arg(long)]
    server: Option<String>,

    /// SSH username
    #[arg(long)]
    user: Option<String>,

    /// Path to SSH private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Remote port range to scan, e.g. 3000-9000
    #[arg(long)]
    scan_ports: Option<String>,

    /// Local port for the dashboard
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// First local port used when a remote port can't be mirrored
    #[arg(long)]
    tunnel_start_port: Option<u16>,

    /// Where to look for services: docker, direct or both
    #[arg(long)]
    detection_mode: Option<DetectionMode>,

    /// Disable SSH host key verification
    #[arg(long)]
    insecure: bool,

    /// Alternative daemon config file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn connection(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            server: self.server.clone(),
            user: self.user.clone(),
            key: self.key.clone(),
        }
    }

    /// Command-line values win over the config file
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(range) = &self.scan_ports {
            config.scan_ports = range.clone();
        }
        if let Some(port) = self.dashboard_port {
            config.dashboard_port = port;
        }
        if let Some(port) = self.tunnel_start_port {
            config.tunnel_start_port = port;
        }
        if let Some(mode) = self.detection_mode {
            config.detection_mode = mode;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tunnel_dash=info,tunnel_dash_daemon=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Tunnel Dash starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build: {} ({})",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown")
    );

    let mut daemon_config = match &args.config {
        Some(path) => DaemonConfig::load_from(path)?,
        None => DaemonConfig::load()?,
    };
    args.apply(&mut daemon_config);
    daemon_config
        .validate()
        .context("Invalid command-line options")?;

    let target = resolve_target(&args.connection(), None)?;
    let policy = HostKeyPolicy::from_insecure(args.insecure);
    if args.insecure {
        info!("⚠️  WARNING: host key verification disabled");
    }
    info!("Connecting to {}", target);

    let client = SshClient::new(target)
        .with_program(&daemon_config.ssh_program)
        .with_host_key_policy(policy);

    let controller = Controller::new(client, &daemon_config)?;
    let tunnel_manager = controller.tunnel_manager().clone();
    tunnel_manager.set_host_key_policy(policy).await;
    info!(
        "Host key checking for forwards: {:?}",
        tunnel_manager.host_key_policy().await
    );

    // Log tunnels that die after startup
    tokio::spawn(log_tunnel_events(tunnel_manager.subscribe()));

    // Signals are handled from here on, including during discovery
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            shutdown.cancel();
        }
    });

    let services = match controller.discover_until(&shutdown).await? {
        Some(services) => services,
        None => {
            info!("Tunnel Dash shut down before the dashboard started");
            return Ok(());
        }
    };

    let view = ViewModel::build(&services, &tunnel_manager.port_map().await);
    print!("{}", render_cli(&view));

    // Create shutdown broadcast channel for graceful SSE stream termination
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = Arc::new(AppState {
        tunnel_manager: tunnel_manager.clone(),
        scanner: controller.scanner().clone(),
        services: RwLock::new(services),
        shutdown_tx: shutdown_tx.clone(),
    });

    let bind_address = daemon_config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tunnel_manager.close_all().await;
            return Err(e).context(format!("Failed to bind to {}", bind_address));
        }
    };

    info!("Dashboard available at http://{}", bind_address);
    println!("\nDashboard: http://{}  (Ctrl+C to stop)", bind_address);

    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown, shutdown_tx))
        .await
        .context("Dashboard server error");

    tunnel_manager.close_all().await;
    info!("All tunnels closed");
    served?;

    info!("Tunnel Dash shut down");
    Ok(())
}

/// Log every tunnel event until the manager goes away. Returns how many were logged.
async fn log_tunnel_events(mut event_rx: broadcast::Receiver<TunnelEvent>) -> usize {
    let mut logged = 0;
    loop {
        match event_rx.recv().await {
            Ok(event) => {
                info!("Tunnel event: {:?}", event);
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Tunnel event log skipped {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken, shutdown_tx: broadcast::Sender<()>) {
    shutdown.cancelled().await;
    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
