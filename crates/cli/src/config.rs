// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - CLI Config Module
// Where the control CLI finds the running dashboard

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// CLI configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CliConfig {
    /// Base URL of the dashboard daemon
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
}

fn default_dashboard_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            dashboard_url: default_dashboard_url(),
        }
    }
}

impl CliConfig {
    /// Load CLI configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).context("Failed to read CLI configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse CLI configuration")?;

        Ok(config)
    }

    /// Base URL to use, with `--url` taking precedence over the file
    pub fn base_url(&self, url_override: Option<&str>) -> String {
        url_override
            .unwrap_or(&self.dashboard_url)
            .trim_end_matches('/')
            .to_string()
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("tunnel-dash").join("cli.toml"))
    }
}
