// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - SSH Config Module
// Resolves a Host alias from the user's ssh client configuration

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Connection details resolved for one `Host` alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// The alias that was looked up
    pub host: String,
    /// Real host name (defaults to the alias)
    pub host_name: String,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: u16,
}

impl HostConfig {
    fn new(alias: &str) -> Self {
        Self {
            host: alias.to_string(),
            host_name: String::new(),
            user: None,
            identity_file: None,
            port: 22,
        }
    }
}

/// Path of the ssh config file: `$SSH_CONFIG`, else `~/.ssh/config`
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("SSH_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| Error::SshConfig("Could not determine home directory".to_string()))?;
    Ok(home.join(".ssh").join("config"))
}

/// Resolve `alias` from the default ssh config file
pub fn resolve_host(alias: &str) -> Result<HostConfig> {
    let path = default_config_path()?;
    resolve_host_from(&path, alias)
}

/// Resolve `alias` from a specific ssh config file
pub fn resolve_host_from(path: &Path, alias: &str) -> Result<HostConfig> {
    let contents = fs::read_to_string(path).map_err(|e| {
        Error::SshConfig(format!("Failed to open SSH config {}: {}", path.display(), e))
    })?;

    debug!("Resolving host '{}' from {}", alias, path.display());
    Ok(parse_host_config(&contents, alias))
}

/// Whether a single `Host` pattern matches the alias
fn pattern_matches(pattern: &str, alias: &str) -> bool {
    if pattern == alias || pattern == "*" {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) => alias.ends_with(suffix),
        None => false,
    }
}

fn expand_tilde(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(value)
}

/// Parse ssh config text and collect the settings that apply to `alias`
///
/// Like ssh, the first value obtained for each keyword wins.
pub fn parse_host_config(contents: &str, alias: &str) -> HostConfig {
    let mut config = HostConfig::new(alias);
    let mut port_set = false;
    let mut in_matching_block = false;

    for raw in contents.lines() {
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            continue;
        };
        let keyword = keyword.to_ascii_lowercase();
        let values: Vec<&str> = parts.collect();

        if keyword == "host" {
            in_matching_block = values.iter().any(|p| pattern_matches(p, alias));
            continue;
        }

        if !in_matching_block || values.is_empty() {
            continue;
        }

        let value = values.join(" ");
        match keyword.as_str() {
            "hostname" if config.host_name.is_empty() => config.host_name = value,
            "user" if config.user.is_none() => config.user = Some(value),
            "identityfile" if config.identity_file.is_none() => {
                config.identity_file = Some(expand_tilde(&value))
            }
            "port" if !port_set => {
                if let Ok(port) = value.parse() {
                    config.port = port;
                    port_set = true;
                }
            }
            _ => {}
        }
    }

    if config.host_name.is_empty() {
        config.host_name = alias.to_string();
    }

    config
}
