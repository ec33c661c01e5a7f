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

//! Reference-counted pool of shared SSH sessions.
//!
//! Tunnels that target the same `user@host:port` share one session. The
//! pool owns session lifetime: a tunnel leases a session with
//! [`ConnectionPool::acquire`] and gives it back with
//! [`ConnectionPool::release`]; the session is closed when the last lease
//! is returned.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::transport::SharedTransport;
use crate::config::TunnelConfig;

/// Identity of a shareable session.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionIdentity {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SessionIdentity {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl From<&TunnelConfig> for SessionIdentity {
    fn from(config: &TunnelConfig) -> Self {
        Self::new(&config.auth.user, &config.ssh_host, config.ssh_port)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Outcome of returning a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other tunnels still hold the session.
    Detached { remaining: usize },
    /// This was the last lease; the session has been closed.
    Closed,
    /// Nothing was pooled under that identity.
    NotPooled,
}

struct PooledSession {
    transport: SharedTransport,
    refcount: usize,
}

/// Connection pool for SSH sessions.
///
/// One lock guards the whole map and is held across dialing, so two tunnels
/// starting against the same endpoint never run parallel handshakes.
#[derive(Default)]
pub struct ConnectionPool {
    sessions: Mutex<HashMap<SessionIdentity, PooledSession>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the session for `identity`, dialing it with `dial` if absent.
    ///
    /// A pooled session that already reports itself closed is discarded and
    /// redialed. The dead session's outstanding leases are carried over so
    /// their later releases stay balanced against the replacement.
    pub async fn acquire<F, Fut, E>(
        &self,
        identity: &SessionIdentity,
        dial: F,
    ) -> Result<SharedTransport, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedTransport, E>>,
    {
        let mut sessions = self.sessions.lock().await;

        let mut carried = 0;
        if let Some(session) = sessions.get_mut(identity) {
            if !session.transport.is_closed() {
                session.refcount += 1;
                debug!(
                    "Reusing pooled session {} (refcount {})",
                    identity, session.refcount
                );
                return Ok(session.transport.clone());
            }

            warn!("Pooled session {} is closed, dialing a new one", identity);
            if let Some(dead) = sessions.remove(identity) {
                dead.transport.close().await;
                carried = dead.refcount;
            }
        }

        let transport = dial().await?;
        sessions.insert(
            identity.clone(),
            PooledSession {
                transport: transport.clone(),
                refcount: carried + 1,
            },
        );
        debug!("Pooled new session {}", identity);
        Ok(transport)
    }

    /// Return a lease. The session is closed when its count reaches zero.
    pub async fn release(&self, identity: &SessionIdentity) -> Release {
        let closing = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(identity) else {
                debug!("Release of {} ignored: not pooled", identity);
                return Release::NotPooled;
            };

            session.refcount = session.refcount.saturating_sub(1);
            if session.refcount > 0 {
                debug!(
                    "Detached from session {} ({} lease(s) remain)",
                    identity, session.refcount
                );
                return Release::Detached {
                    remaining: session.refcount,
                };
            }
            sessions.remove(identity)
        };

        if let Some(session) = closing {
            debug!("Closing session {}: last lease released", identity);
            session.transport.close().await;
        }
        Release::Closed
    }

    /// Current lease count for `identity`, zero when not pooled.
    pub async fn refcount(&self, identity: &SessionIdentity) -> usize {
        self.sessions
            .lock()
            .await
            .get(identity)
            .map_or(0, |session| session.refcount)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Close every pooled session regardless of outstanding leases.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (identity, session) in drained {
            debug!(
                "Closing session {} at shutdown ({} lease(s) outstanding)",
                identity, session.refcount
            );
            session.transport.close().await;
        }
    }
}
