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

//! Port forwarding engine.
//!
//! Each configured forward becomes a listener plus an accept loop that hands
//! every accepted connection to its own task:
//!
//! - **Local** (`-L`): listen locally, dial the target through SSH
//! - **Remote** (`-R`): the server listens, we dial the target over plain TCP
//! - **Dynamic** (`-D`): listen locally as a SOCKS5 proxy, dial whatever the
//!   client asks for through SSH
//!
//! Setting up a forward ([`bind_forward`]) is separate from running it
//! ([`accept::run_accept_loop`]) so a tunnel can bind every forward before
//! serving any of them.

pub mod accept;
pub mod dynamic;
pub mod listener;
pub mod local;
pub mod relay;
pub mod remote;

pub use accept::run_accept_loop;
pub use listener::TcpForwardListener;
pub use relay::{relay, RelayStats};

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ForwardConfig, ForwardKind};
use crate::ssh::{ForwardListener, SharedTransport};

/// Malformed `host:port` strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port")]
    MissingPort,

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unterminated '[' in IPv6 address")]
    UnclosedBracket,
}

/// Split `host:port`. IPv6 hosts are written in brackets (`[::1]:22`) and
/// returned without them. The host may be empty (`:8080`).
pub fn split_host_port(addr: &str) -> Result<(String, u16), AddressError> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or(AddressError::UnclosedBracket)?;
        let port = rest.strip_prefix(':').ok_or(AddressError::MissingPort)?;
        (host, port)
    } else {
        addr.rsplit_once(':').ok_or(AddressError::MissingPort)?
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
    Ok((host.to_string(), port))
}

/// Inverse of [`split_host_port`].
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Where accepted connections of one forward go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Dial `host:port` through the SSH session.
    Local { host: String, port: u16 },
    /// Dial `host:port` directly over TCP.
    Remote { host: String, port: u16 },
    /// Ask each client (SOCKS5) where to go.
    Dynamic,
}

impl Route {
    pub fn for_forward(forward: &ForwardConfig) -> Result<Self, AddressError> {
        Ok(match forward.kind {
            ForwardKind::Local => {
                let (host, port) = split_host_port(&forward.remote_addr)?;
                Route::Local { host, port }
            }
            ForwardKind::Remote => {
                let (host, port) = split_host_port(&forward.local_addr)?;
                Route::Remote { host, port }
            }
            ForwardKind::Dynamic => Route::Dynamic,
        })
    }
}

/// Read access to the owning tunnel's stopping state.
///
/// Implementations read it under the same lock the tunnel uses to change
/// status, so an accept error racing a stop is classified correctly.
pub trait StopFlag: Send + Sync {
    fn is_stopping(&self) -> bool;
}

/// Everything an accept loop and its connection handlers share.
#[derive(Clone)]
pub struct ForwardContext {
    pub tunnel: Arc<str>,
    pub transport: SharedTransport,
    pub cancel: CancellationToken,
    pub connections: TaskTracker,
    pub stop: Arc<dyn StopFlag>,
    pub socks_handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

/// Create the listener for `forward` without accepting anything yet.
///
/// Local and dynamic forwards bind `local_addr` on this machine; remote
/// forwards ask the server to listen on `remote_addr`.
pub async fn bind_forward(
    forward: &ForwardConfig,
    transport: &SharedTransport,
) -> io::Result<Arc<dyn ForwardListener>> {
    match forward.kind {
        ForwardKind::Local | ForwardKind::Dynamic => {
            let listener = TcpForwardListener::bind(&forward.local_addr).await?;
            Ok(Arc::new(listener))
        }
        ForwardKind::Remote => {
            let (host, port) = split_host_port(&forward.remote_addr)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let listener = transport.listen_remote(&host, port).await?;
            Ok(Arc::from(listener))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("127.0.0.1:8080").unwrap(),
            ("127.0.0.1".to_string(), 8080)
        );
        assert_eq!(
            split_host_port("example.org:80").unwrap(),
            ("example.org".to_string(), 80)
        );
        assert_eq!(split_host_port("[::1]:22").unwrap(), ("::1".to_string(), 22));
        assert_eq!(split_host_port(":1080").unwrap(), (String::new(), 1080));
    }

    #[test]
    fn test_split_host_port_errors() {
        assert_eq!(split_host_port("localhost"), Err(AddressError::MissingPort));
        assert_eq!(
            split_host_port("localhost:http"),
            Err(AddressError::InvalidPort("http".to_string()))
        );
        assert_eq!(
            split_host_port("localhost:70000"),
            Err(AddressError::InvalidPort("70000".to_string()))
        );
        assert_eq!(split_host_port("[::1:22"), Err(AddressError::UnclosedBracket));
        assert_eq!(split_host_port("[::1]"), Err(AddressError::MissingPort));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.org", 22), "example.org:22");
        assert_eq!(join_host_port("::1", 22), "[::1]:22");
    }

    #[test]
    fn test_route_for_forward() {
        assert_eq!(
            Route::for_forward(&ForwardConfig::local("127.0.0.1:8080", "example.org:80")).unwrap(),
            Route::Local {
                host: "example.org".to_string(),
                port: 80
            }
        );
        assert_eq!(
            Route::for_forward(&ForwardConfig::remote("0.0.0.0:9000", "localhost:3000")).unwrap(),
            Route::Remote {
                host: "localhost".to_string(),
                port: 3000
            }
        );
        assert_eq!(
            Route::for_forward(&ForwardConfig::dynamic("127.0.0.1:1080")).unwrap(),
            Route::Dynamic
        );
    }
}
