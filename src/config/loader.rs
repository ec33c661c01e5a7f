// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration loading and saving.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::{Config, TunnelConfig};
use super::utils::expand_tilde;

const CONFIG_FILE_NAME: &str = "tunnels.yaml";

const INVALID_TUNNELS: &str = "Invalid tunnel configuration.\nCommon issues:\n  - Incorrect indentation (use spaces, not tabs)\n  - Missing required keys (name, ssh_host, auth.user)\n  - Unknown forward type (use local, remote or dynamic)";

impl Config {
    /// Load configuration from a file.
    ///
    /// A missing file yields an empty configuration. Both the full
    /// `{settings, tunnels}` document and a bare list of tunnels (the JSON
    /// array written by earlier releases) are accepted.
    pub async fn load(path: &Path) -> Result<Self> {
        let expanded_path = expand_tilde(path);

        if !expanded_path.exists() {
            tracing::debug!(
                "Config file not found at {:?}, using defaults",
                expanded_path
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&expanded_path)
            .await
            .with_context(|| format!("Failed to read configuration file at {}. Please check file permissions and ensure the file is accessible.", expanded_path.display()))?;

        let mut config = Self::parse(&content).with_context(|| {
            format!(
                "Failed to parse configuration file at {}",
                expanded_path.display()
            )
        })?;

        for tunnel in &mut config.tunnels {
            if let Some(key_path) = tunnel.auth.key_path.as_mut() {
                *key_path = expand_tilde(key_path);
            }
        }

        tracing::debug!(
            "Loaded {} tunnel(s) from {}",
            config.tunnels.len(),
            expanded_path.display()
        );
        Ok(config)
    }

    /// Parse a configuration document.
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: serde_yaml::Value =
            serde_yaml::from_str(content).context("Invalid YAML/JSON syntax")?;

        // A bare sequence is the tunnel list written by earlier releases.
        let config = if document.is_sequence() {
            Self {
                tunnels: serde_yaml::from_value::<Vec<TunnelConfig>>(document)
                    .context(INVALID_TUNNELS)?,
                ..Self::default()
            }
        } else {
            serde_yaml::from_value(document).context(INVALID_TUNNELS)?
        };
        Ok(config)
    }

    /// Save configuration to a file, creating parent directories as needed.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let expanded_path = expand_tilde(path);

        if let Some(parent) = expanded_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }
        }

        let yaml =
            serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")?;

        fs::write(&expanded_path, yaml)
            .await
            .with_context(|| format!("Failed to write configuration to {expanded_path:?}"))?;

        Ok(())
    }

    /// Default location of the tunnel file.
    ///
    /// `$XDG_CONFIG_HOME/sshtm/tunnels.yaml`, then the platform config
    /// directory, then `~/.sshtm/tunnels.yaml`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config_home)
                .join("sshtm")
                .join(CONFIG_FILE_NAME));
        } else if let Some(proj_dirs) = ProjectDirs::from("", "", "sshtm") {
            return Ok(proj_dirs.config_dir().join(CONFIG_FILE_NAME));
        }

        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .context("Unable to determine home directory")?;
        Ok(PathBuf::from(home).join(".sshtm").join(CONFIG_FILE_NAME))
    }
}
