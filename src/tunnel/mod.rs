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

//! Tunnel lifecycle: starting, stopping and watching configured tunnels.
//!
//! A [`RunningTunnel`] owns the listeners of one started tunnel and a lease
//! on a pooled SSH session. The [`TunnelManager`] keeps tunnels by name and
//! broadcasts a [`TunnelEvent`] on every status change; the
//! [`HealthMonitor`] periodically probes the connected ones.
//!
//! # Status transitions
//!
//! ```text
//! Stopped -> Connecting -> Connected -> Disconnected
//!                 |
//!                 +------> Error
//! Connected / Error / Disconnected -> Stopped   (explicit stop)
//! ```
//!
//! Nothing reconnects automatically.

pub mod health;
pub mod manager;
pub mod running;

pub use health::HealthMonitor;
pub use manager::TunnelManager;
pub use running::RunningTunnel;

use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use thiserror::Error;

use crate::config::{ConfigError, ForwardConfig};
use crate::ssh::tokio_client;

/// Externally visible state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Stopped,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl Status {
    /// True while the tunnel holds (or is acquiring) network resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::Connected | Status::Disconnected
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Stopped => "stopped",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Error => "error",
            Status::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of one tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSnapshot {
    pub name: String,
    pub status: Status,
    pub error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub forwards: Vec<ForwardConfig>,
}

/// Broadcast on every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub name: String,
    pub status: Status,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] tokio_client::Error),

    #[error("Failed to set up forward {forward}: {source}")]
    Forward {
        forward: String,
        #[source]
        source: io::Error,
    },

    #[error("Tunnel was stopped before it finished starting")]
    Stopped,

    #[error("Tunnel '{0}' is already running")]
    AlreadyRunning(String),

    #[error("No tunnel named '{0}'")]
    NotFound(String),
}

impl TunnelError {
    /// True when retrying without editing the configuration cannot help.
    pub fn is_configuration(&self) -> bool {
        match self {
            TunnelError::Config(_) => true,
            TunnelError::Transport(e) => e.is_configuration(),
            _ => false,
        }
    }
}
