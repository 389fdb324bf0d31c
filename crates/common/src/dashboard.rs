// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - Dashboard Rendering
// View model over detected services, rendered as an HTML page or a terminal table

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use serde::{Deserialize, Serialize};

use crate::service::{local_url, Service, ServiceType};

/// Group key for services without a Docker network
pub const DEFAULT_NETWORK: &str = "default";

/// How a service can be reached from this machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Has a local URL through a tunnel
    Accessible,
    /// Only reachable through a proxy domain
    Proxied,
    /// Not reachable from outside the remote host
    Internal,
}

impl AccessLevel {
    fn css_class(&self) -> &'static str {
        match self {
            AccessLevel::Accessible => "accessible",
            AccessLevel::Proxied => "proxied",
            AccessLevel::Internal => "no-access",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AccessLevel::Accessible => "accessible",
            AccessLevel::Proxied => "proxied",
            AccessLevel::Internal => "internal",
        }
    }
}

/// A service with its access level and local port resolved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceView {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub description: String,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub local_port: Option<u16>,
    pub domain: Option<String>,
    pub network: Option<String>,
    pub access: AccessLevel,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStats {
    pub total: usize,
    pub accessible: usize,
    pub proxied: usize,
    pub internal: usize,
}

/// Everything needed to render the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewModel {
    pub services: Vec<ServiceView>,
    pub groups: BTreeMap<String, Vec<ServiceView>>,
    pub stats: DashboardStats,
    pub networks: Vec<String>,
}

/// Sort and re-join a comma separated network list; blank lists become `None`
pub fn normalize_network_name(network: &str) -> Option<String> {
    let mut parts: Vec<&str> = network
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    parts.sort_unstable();
    Some(parts.join(", "))
}

fn build_service_view(svc: &Service, local_ports: &HashMap<u16, u16>) -> ServiceView {
    let proxied = svc.is_proxied();
    let mut url = svc.url.clone();
    let mut local_port = None;

    if let Some(port) = svc.port.filter(|_| !proxied) {
        match local_ports.get(&port) {
            Some(&lp) => {
                local_port = Some(lp);
                if url.is_none() {
                    url = Some(local_url("http", lp));
                }
            }
            // No tunnel, nothing to link to
            None => url = None,
        }
    }

    let access = if url.is_some() {
        AccessLevel::Accessible
    } else if svc.domain.is_some() {
        AccessLevel::Proxied
    } else {
        AccessLevel::Internal
    };

    ServiceView {
        name: svc.name.clone(),
        service_type: svc.service_type,
        description: svc.description.clone(),
        url,
        port: svc.port,
        local_port,
        domain: svc.domain.clone(),
        network: svc.network.as_deref().and_then(normalize_network_name),
        access,
    }
}

impl ViewModel {
    /// Build the view model. `local_ports` maps remote ports to tunnel ports.
    pub fn build(services: &[Service], local_ports: &HashMap<u16, u16>) -> Self {
        let mut views = Vec::with_capacity(services.len());
        let mut networks = BTreeSet::new();
        let mut stats = DashboardStats::default();
        let mut groups: BTreeMap<String, Vec<ServiceView>> = BTreeMap::new();

        // Proxies are plumbing, not destinations
        for svc in services.iter().filter(|s| s.service_type != ServiceType::Nginx) {
            let view = build_service_view(svc, local_ports);

            match view.access {
                AccessLevel::Accessible => stats.accessible += 1,
                AccessLevel::Proxied => stats.proxied += 1,
                AccessLevel::Internal => stats.internal += 1,
            }

            let group = match &view.network {
                Some(net) => {
                    networks.insert(net.clone());
                    net.clone()
                }
                None => DEFAULT_NETWORK.to_string(),
            };
            groups.entry(group).or_default().push(view.clone());
            views.push(view);
        }

        stats.total = views.len();

        Self {
            services: views,
            groups,
            stats,
            networks: networks.into_iter().collect(),
        }
    }

    /// Groups in display order: named networks alphabetically, then the default group
    pub fn ordered_groups(&self) -> impl Iterator<Item = (&str, &[ServiceView])> {
        let named = self
            .groups
            .iter()
            .filter(|(name, _)| name.as_str() != DEFAULT_NETWORK);
        let default = self.groups.get_key_value(DEFAULT_NETWORK);

        named
            .chain(default)
            .map(|(name, views)| (name.as_str(), views.as_slice()))
    }
}

/// Escape text for HTML element content and attribute values
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const STYLE: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }
body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f4f5fb; color: #333; padding: 20px; }
.container { max-width: 1400px; margin: 0 auto; }
.header { background: white; padding: 30px; border-radius: 12px; box-shadow: 0 4px 12px rgba(0,0,0,0.08); margin-bottom: 24px; text-align: center; }
.header h1 { color: #5a67d8; margin-bottom: 8px; }
.stats-grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(180px, 1fr)); gap: 16px; margin-bottom: 24px; }
.stat-card { background: white; padding: 20px; border-radius: 12px; text-align: center; box-shadow: 0 2px 8px rgba(0,0,0,0.06); }
.stat-value { font-size: 32px; font-weight: 700; }
.stat-label { font-size: 13px; color: #666; text-transform: uppercase; letter-spacing: 0.5px; }
.search-box { width: 100%; padding: 12px 18px; border: 2px solid #e0e0e0; border-radius: 8px; margin-bottom: 20px; font-size: 14px; }
.network-section { margin-bottom: 28px; }
.network-header { display: flex; align-items: center; gap: 12px; margin-bottom: 12px; }
.network-badge { background: #e3e8ff; color: #4c51bf; padding: 2px 10px; border-radius: 10px; font-size: 12px; }
.services-grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(300px, 1fr)); gap: 16px; }
.service-card { background: white; border-radius: 12px; padding: 20px; box-shadow: 0 2px 8px rgba(0,0,0,0.06); border-top: 3px solid #48bb78; }
.service-card.proxied { border-top-color: #ed8936; }
.service-card.no-access { border-top-color: #9f7aea; opacity: 0.85; }
.service-name { font-weight: 600; font-size: 17px; }
.service-type { font-size: 12px; color: #888; text-transform: uppercase; margin-bottom: 8px; }
.service-description { font-size: 14px; color: #555; margin-bottom: 12px; }
.service-link { display: inline-block; background: #5a67d8; color: white; padding: 8px 16px; border-radius: 6px; text-decoration: none; margin-bottom: 10px; }
.port-info { font-size: 13px; color: #666; }
.empty { background: white; padding: 40px; border-radius: 12px; text-align: center; color: #666; }
#events { font-size: 12px; color: #888; margin-top: 8px; }
"#;

const SCRIPT: &str = r#"
document.getElementById('search').addEventListener('input', function (e) {
  var q = e.target.value.toLowerCase();
  document.querySelectorAll('.service-card').forEach(function (card) {
    card.style.display = card.dataset.serviceName.toLowerCase().includes(q) ? '' : 'none';
  });
});
if (window.EventSource) {
  var es = new EventSource('/api/events');
  es.onmessage = function (m) {
    var ev = JSON.parse(m.data);
    if (ev.type === 'heartbeat') return;
    document.getElementById('events').textContent =
      'tunnel ' + ev.remote_port + ': ' + ev.type + (ev.reason ? ' (' + ev.reason + ')' : '');
  };
}
"#;

fn write_stat(html: &mut String, value: usize, label: &str, color: &str) {
    let _ = write!(
        html,
        r#"<div class="stat-card"><div class="stat-value" style="color: {};">{}</div><div class="stat-label">{}</div></div>"#,
        color, value, label
    );
}

fn write_service_card(html: &mut String, view: &ServiceView) {
    let name = escape_html(&view.name);
    let _ = write!(
        html,
        r#"<div class="service-card {}" data-service-name="{}">"#,
        view.access.css_class(),
        name
    );
    let _ = write!(
        html,
        r#"<div class="service-name">{}</div><div class="service-type">{}</div><div class="service-description">{}</div>"#,
        name,
        view.service_type,
        escape_html(&view.description)
    );

    match (&view.url, &view.domain) {
        (Some(url), _) => {
            let _ = write!(
                html,
                r#"<a href="{}" target="_blank" rel="noopener" class="service-link">Open Service</a>"#,
                escape_html(url)
            );
        }
        (None, Some(domain)) => {
            let _ = write!(
                html,
                r#"<div class="port-info">Domain: {} (configured in Nginx)</div>"#,
                escape_html(domain)
            );
        }
        (None, None) => html.push_str(r#"<div class="port-info">Internal network only</div>"#),
    }

    if let Some(network) = &view.network {
        let _ = write!(html, r#"<div class="port-info">Network: {}</div>"#, escape_html(network));
    }

    match (view.port, view.local_port) {
        (Some(port), Some(local)) => {
            let _ = write!(html, r#"<div class="port-info">Port: {} &rarr; Local: {}</div>"#, port, local);
        }
        (Some(port), None) => {
            let _ = write!(html, r#"<div class="port-info">Port: {}</div>"#, port);
        }
        _ => {}
    }

    html.push_str("</div>");
}

/// Render a self-contained HTML page
pub fn render_html(view: &ViewModel) -> String {
    let mut html = String::with_capacity(8 * 1024);

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n");
    html.push_str("<title>Tunnel Dash</title>\n<style>");
    html.push_str(STYLE);
    html.push_str("</style>\n</head>\n<body>\n<div class=\"container\">\n");
    html.push_str("<div class=\"header\"><h1>Tunnel Dash</h1><p>Remote services reachable through SSH tunnels</p><div id=\"events\"></div></div>\n");

    html.push_str("<div class=\"stats-grid\">");
    write_stat(&mut html, view.stats.total, "Total Services", "#5a67d8");
    write_stat(&mut html, view.stats.accessible, "Accessible", "#48bb78");
    write_stat(&mut html, view.stats.proxied, "Proxied", "#ed8936");
    write_stat(&mut html, view.stats.internal, "Internal", "#9f7aea");
    html.push_str("</div>\n");

    if view.services.is_empty() {
        html.push_str("<div class=\"empty\">No services detected.</div>\n");
    } else {
        html.push_str("<input id=\"search\" class=\"search-box\" type=\"text\" placeholder=\"Filter services...\">\n");
        for (network, services) in view.ordered_groups() {
            let title = if network == DEFAULT_NETWORK {
                "Other Services".to_string()
            } else {
                format!("Network: {}", escape_html(network))
            };
            let _ = write!(
                html,
                r#"<div class="network-section"><div class="network-header"><h2>{}</h2><span class="network-badge">{} service(s)</span></div><div class="services-grid">"#,
                title,
                services.len()
            );
            for svc in services {
                write_service_card(&mut html, svc);
            }
            html.push_str("</div></div>\n");
        }
    }

    html.push_str("</div>\n<script>");
    html.push_str(SCRIPT);
    html.push_str("</script>\n</body>\n</html>\n");
    html
}

/// Render the terminal summary printed at startup
pub fn render_cli(view: &ViewModel) -> String {
    if view.services.is_empty() {
        return "No services detected.\n".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(
        ["Service", "Type", "Remote", "Local", "Access", "Network"]
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan)),
    );

    for svc in &view.services {
        let access = match (&svc.url, &svc.domain) {
            (Some(url), _) => Cell::new(url).fg(Color::Green),
            (None, Some(domain)) => Cell::new(format!("via {}", domain)).fg(Color::Yellow),
            (None, None) => Cell::new(svc.access.label()).fg(Color::DarkGrey),
        };

        table.add_row(vec![
            Cell::new(&svc.name).fg(Color::Green),
            Cell::new(svc.service_type.as_str()),
            Cell::new(svc.port.map_or("-".to_string(), |p| p.to_string())),
            Cell::new(svc.local_port.map_or("-".to_string(), |p| p.to_string())),
            access,
            Cell::new(svc.network.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", table);
    let _ = writeln!(
        out,
        "{} service(s): {} accessible, {} proxied, {} internal",
        view.stats.total.to_string().cyan(),
        view.stats.accessible.to_string().green(),
        view.stats.proxied.to_string().yellow(),
        view.stats.internal.to_string().dimmed()
    );
    out
}
