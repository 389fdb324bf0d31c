// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Control CLI
// Talks to a running dashboard daemon

mod client;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use futures::StreamExt;

use tunnel_dash_common::{ScanResponse, TunnelEvent, TunnelState, TunnelStatusResponse};

use client::DashboardClient;
use config::CliConfig;

#[derive(Parser)]
#[command(name = "tunnel-dash-ctl")]
#[command(about = "Control a running Tunnel Dash daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Dashboard URL (overrides cli.toml)
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected services
    Services {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// List tunnels and their health
    Tunnels {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Open a tunnel to a remote port
    Open {
        /// Remote port
        port: u16,
    },

    /// Close the tunnel for a remote port
    Close {
        /// Remote port
        port: u16,
    },

    /// Scan the remote host for listening ports
    Scan {
        /// Port range, e.g. 3000-9000
        #[arg(short, long, default_value = "3000-9000")]
        range: String,
    },

    /// Check that the dashboard is up
    Health,

    /// Follow tunnel events
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base_url = CliConfig::load()?.base_url(cli.url.as_deref());
    let client = DashboardClient::new(base_url)?;

    match cli.command {
        Commands::Services { json } => list_services(&client, json).await,
        Commands::Tunnels { json } => list_tunnels(&client, json).await,
        Commands::Open { port } => open_tunnel(&client, port).await,
        Commands::Close { port } => close_tunnel(&client, port).await,
        Commands::Scan { range } => scan(&client, &range).await,
        Commands::Health => health(&client).await,
        Commands::Watch => watch_events(&client).await,
    }
}

fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| {
            Cell::new(label)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

async fn list_services(client: &DashboardClient, json: bool) -> Result<()> {
    let services = client.services().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    if services.is_empty() {
        println!("{}", "No services detected.".yellow());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Port", "Service", "Type", "URL", "Description"]));

    for svc in &services {
        let port = svc
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let url = svc
            .url
            .clone()
            .or_else(|| svc.domain.clone())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(port),
            Cell::new(&svc.name).fg(Color::Green),
            Cell::new(svc.service_type.as_str()),
            Cell::new(url).fg(Color::Blue),
            Cell::new(&svc.description).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} service(s)", services.len().to_string().cyan());
    Ok(())
}

fn state_cell(tunnel: &TunnelStatusResponse) -> Cell {
    let label = tunnel.info.state.to_string();
    match (tunnel.info.state, tunnel.healthy) {
        (TunnelState::Active, true) => Cell::new(label).fg(Color::Green),
        // Died since the last listing refresh
        (TunnelState::Active, false) => Cell::new(label).fg(Color::Yellow),
        (TunnelState::Failed, _) => Cell::new(label).fg(Color::Red),
    }
}

async fn list_tunnels(client: &DashboardClient, json: bool) -> Result<()> {
    let tunnels = client.tunnels().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("{}", "No tunnels open.".yellow());
        println!("Open one with: {}", "tunnel-dash-ctl open <port>".cyan());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Remote", "Local", "State", "Since", "Failure"]));

    for tunnel in &tunnels {
        table.add_row(vec![
            Cell::new(tunnel.info.remote_port),
            Cell::new(format!("localhost:{}", tunnel.info.local_port)),
            state_cell(tunnel),
            Cell::new(tunnel.info.created_at.format("%H:%M:%S").to_string()),
            Cell::new(tunnel.info.failure.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} tunnel(s)", tunnels.len().to_string().cyan());
    Ok(())
}

async fn open_tunnel(client: &DashboardClient, port: u16) -> Result<()> {
    let created = client.open_tunnel(port).await?;
    println!(
        "{} remote port {} is available at {}",
        "✓".green(),
        created.remote_port,
        created.url.cyan()
    );
    tracing::debug!("Local port {}", created.local_port);
    Ok(())
}

async fn close_tunnel(client: &DashboardClient, port: u16) -> Result<()> {
    let message = client.close_tunnel(port).await?;
    println!("{} {}", "✓".green(), message);
    Ok(())
}

async fn scan(client: &DashboardClient, range: &str) -> Result<()> {
    match client.scan(range).await? {
        ScanResponse::Ports { ports, count } => {
            if ports.is_empty() {
                println!("{}", format!("No listening ports in {}", range).yellow());
            } else {
                let list: Vec<String> = ports.iter().map(u16::to_string).collect();
                println!("{} port(s) listening: {}", count.to_string().cyan(), list.join(", "));
            }
            Ok(())
        }
        ScanResponse::Error { error } => anyhow::bail!("Scan failed: {}", error),
    }
}

async fn health(client: &DashboardClient) -> Result<()> {
    let health = client.health().await?;
    println!(
        "{} dashboard is {} ({} service(s))",
        "●".green(),
        health.status.green(),
        health.services
    );
    Ok(())
}

async fn watch_events(client: &DashboardClient) -> Result<()> {
    let events = client.events().await?;
    futures::pin_mut!(events);

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    while let Some(event) = events.next().await {
        match event {
            Ok(TunnelEvent::Starting { remote_port, local_port }) => {
                println!("{}", format!("Starting tunnel {remote_port} -> localhost:{local_port}").cyan());
            }
            Ok(TunnelEvent::Active { remote_port, local_port }) => {
                println!("{}", format!("Tunnel {remote_port} active on localhost:{local_port}").green());
            }
            Ok(TunnelEvent::Failed { remote_port, reason, .. }) => {
                eprintln!("{}", format!("Tunnel {remote_port} failed: {reason}").red());
            }
            Ok(TunnelEvent::Closed { remote_port }) => {
                println!("{}", format!("Tunnel {remote_port} closed").yellow());
            }
            Ok(TunnelEvent::Heartbeat { .. }) => {
                // Ignore heartbeats in watch mode
            }
            Err(e) => eprintln!("{}", format!("{:#}", e).red()),
        }
    }

    println!("{}", "Event stream ended.".dimmed());
    Ok(())
}
