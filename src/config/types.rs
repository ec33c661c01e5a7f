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

//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::forwarding::split_host_port;

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub settings: EngineSettings,

    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Engine-wide timing knobs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub connect_timeout_secs: u64,
    pub proxy_connect_timeout_secs: u64,
    pub heartbeat_threshold_secs: u64,
    pub health_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub socks_handshake_timeout_secs: u64,
    /// 0 disables SSH keepalives.
    pub keepalive_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            proxy_connect_timeout_secs: 10,
            heartbeat_threshold_secs: 120,
            health_interval_secs: 30,
            probe_timeout_secs: 10,
            socks_handshake_timeout_secs: 10,
            keepalive_interval_secs: 60,
        }
    }
}

impl EngineSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn proxy_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_connect_timeout_secs)
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_threshold_secs)
    }

    pub fn health_interval(&self) -> Duration {
        // A zero period would spin the monitor.
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn socks_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.socks_handshake_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

/// One tunnel definition: an SSH endpoint plus the forwards carried over it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub auth: SshAuthConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Credentials for the SSH endpoint.
///
/// Empty strings are treated the same as absent values so files written by
/// older front-ends (which always emit every key) keep working.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SshAuthConfig {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
    #[serde(default)]
    pub use_2fa: bool,
}

impl SshAuthConfig {
    pub fn password(&self) -> Option<&str> {
        non_empty(self.password.as_deref())
    }

    pub fn key_path(&self) -> Option<&PathBuf> {
        self.key_path
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn key_passphrase(&self) -> Option<&str> {
        non_empty(self.key_passphrase.as_deref())
    }
}

impl fmt::Debug for SshAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAuthConfig")
            .field("user", &self.user)
            .field("password", &self.password().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase().map(|_| "<redacted>"))
            .field("use_2fa", &self.use_2fa)
            .finish()
    }
}

/// HTTP(S) forward proxy the SSH connection is tunneled through.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
}

impl ProxyConfig {
    /// A proxy section with an empty host is ignored.
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Basic credentials, present when a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        non_empty(self.username.as_deref())
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

/// The three forwarding strategies.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", try_from = "ForwardKindRepr")]
pub enum ForwardKind {
    /// Listen locally, dial the remote address through SSH.
    Local,
    /// Listen on the SSH server, dial the local address directly.
    Remote,
    /// Listen locally as a SOCKS5 proxy, dial requested targets through SSH.
    Dynamic,
}

impl fmt::Display for ForwardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardKind::Local => write!(f, "Local"),
            ForwardKind::Remote => write!(f, "Remote"),
            ForwardKind::Dynamic => write!(f, "Dynamic (SOCKS)"),
        }
    }
}

/// Integer codes come from the JSON files of earlier releases.
#[derive(Deserialize)]
#[serde(untagged)]
enum ForwardKindRepr {
    Index(u8),
    Name(String),
}

impl TryFrom<ForwardKindRepr> for ForwardKind {
    type Error = String;

    fn try_from(repr: ForwardKindRepr) -> Result<Self, Self::Error> {
        match repr {
            ForwardKindRepr::Index(0) => Ok(ForwardKind::Local),
            ForwardKindRepr::Index(1) => Ok(ForwardKind::Remote),
            ForwardKindRepr::Index(2) => Ok(ForwardKind::Dynamic),
            ForwardKindRepr::Index(other) => Err(format!("unknown forward type {other}")),
            ForwardKindRepr::Name(name) => match name.trim().to_ascii_lowercase().as_str() {
                "local" | "l" => Ok(ForwardKind::Local),
                "remote" | "r" => Ok(ForwardKind::Remote),
                "dynamic" | "d" | "socks" | "dynamic (socks)" => Ok(ForwardKind::Dynamic),
                _ => Err(format!("unknown forward type '{name}'")),
            },
        }
    }
}

/// One forward carried by a tunnel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    #[serde(rename = "type")]
    pub kind: ForwardKind,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub remote_addr: String,
}

impl ForwardConfig {
    pub fn local(local_addr: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            kind: ForwardKind::Local,
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }

    pub fn remote(remote_addr: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            kind: ForwardKind::Remote,
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }

    pub fn dynamic(local_addr: impl Into<String>) -> Self {
        Self {
            kind: ForwardKind::Dynamic,
            local_addr: local_addr.into(),
            remote_addr: String::new(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        // Remote forwards dial local_addr; the others bind it.
        let local_needs_host = self.kind == ForwardKind::Remote;
        check_address("local_addr", &self.local_addr, local_needs_host)?;
        match self.kind {
            ForwardKind::Local => check_address("remote_addr", &self.remote_addr, true),
            ForwardKind::Remote => check_address("remote_addr", &self.remote_addr, false),
            ForwardKind::Dynamic => Ok(()),
        }
    }
}

impl fmt::Display for ForwardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ForwardKind::Local => write!(f, "-L {} -> {}", self.local_addr, self.remote_addr),
            ForwardKind::Remote => write!(f, "-R {} -> {}", self.remote_addr, self.local_addr),
            ForwardKind::Dynamic => write!(f, "-D {} (SOCKS5)", self.local_addr),
        }
    }
}

fn check_address(field: &str, addr: &str, needs_host: bool) -> Result<(), String> {
    if addr.trim().is_empty() {
        return Err(format!("{field} is required"));
    }
    let (host, _) = split_host_port(addr).map_err(|e| format!("{field} '{addr}': {e}"))?;
    if needs_host && host.is_empty() {
        return Err(format!("{field} '{addr}': host is required"));
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Problems found in a tunnel definition before any network activity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tunnel name is empty")]
    EmptyName,

    #[error("SSH host is empty")]
    EmptyHost,

    #[error("SSH port must be between 1 and 65535")]
    ZeroPort,

    #[error("SSH user is empty")]
    EmptyUser,

    #[error("proxy '{0}' needs a non-zero port")]
    ProxyPort(String),

    #[error("forward #{index}: {reason}")]
    Forward { index: usize, reason: String },

    #[error("duplicate tunnel name '{0}'")]
    DuplicateName(String),
}

impl TunnelConfig {
    /// Check the shape of the definition. Credentials are checked by the
    /// dialer, which has to read key files anyway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.ssh_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.auth.user.trim().is_empty() {
            return Err(ConfigError::EmptyUser);
        }
        if let Some(proxy) = self.proxy.as_ref().filter(|p| p.is_enabled()) {
            if proxy.port == 0 {
                return Err(ConfigError::ProxyPort(proxy.host.clone()));
            }
        }
        for (index, forward) in self.forwards.iter().enumerate() {
            forward
                .validate()
                .map_err(|reason| ConfigError::Forward { index, reason })?;
        }
        Ok(())
    }

    /// The enabled proxy section, if any.
    pub fn active_proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref().filter(|p| p.is_enabled())
    }
}

impl Config {
    /// Validate every tunnel and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for tunnel in &self.tunnels {
            tunnel.validate()?;
            if !seen.insert(tunnel.name.as_str()) {
                return Err(ConfigError::DuplicateName(tunnel.name.clone()));
            }
        }
        Ok(())
    }

    pub fn tunnel(&self, name: &str) -> Option<&TunnelConfig> {
        self.tunnels.iter().find(|t| t.name == name)
    }
}
