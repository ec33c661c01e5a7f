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

//! One started tunnel and its resources.

use chrono::{DateTime, Utc};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{Status, TunnelError, TunnelEvent, TunnelSnapshot};
use crate::config::{EngineSettings, TunnelConfig};
use crate::forwarding::{bind_forward, run_accept_loop, ForwardContext, Route, StopFlag};
use crate::ssh::{ConnectionPool, Connector, ForwardListener, SessionIdentity, SharedTransport};
use crate::utils::spawn_tracked;

/// What the tunnel currently owns.
enum Phase {
    Idle,
    Starting,
    Running(Resources),
    Failed,
    Finished,
}

/// Resources released exactly once, by whoever takes them out of
/// [`Phase::Running`].
struct Resources {
    identity: SessionIdentity,
    transport: SharedTransport,
    listeners: Vec<Arc<dyn ForwardListener>>,
}

struct TunnelState {
    status: Status,
    error: Option<String>,
    heartbeat: Option<Instant>,
    heartbeat_at: Option<DateTime<Utc>>,
    phase: Phase,
}

impl TunnelState {
    fn touch(&mut self) {
        self.heartbeat = Some(Instant::now());
        self.heartbeat_at = Some(Utc::now());
    }
}

/// State shared with accept loops.
struct TunnelShared {
    name: Arc<str>,
    state: Mutex<TunnelState>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelShared {
    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change status while holding the lock and announce it.
    fn transition(&self, state: &mut TunnelState, status: Status, error: Option<String>) {
        state.status = status;
        state.error = error.clone();
        // Nobody listening is fine.
        let _ = self.events.send(TunnelEvent {
            name: self.name.to_string(),
            status,
            error,
        });
    }
}

impl StopFlag for TunnelShared {
    fn is_stopping(&self) -> bool {
        matches!(self.lock().phase, Phase::Finished)
    }
}

/// A started tunnel: its listeners, its accept loops and a lease on a
/// pooled SSH session.
///
/// Status queries never wait on network activity. The pooled session is
/// released through the pool, never closed directly.
pub struct RunningTunnel {
    config: TunnelConfig,
    shared: Arc<TunnelShared>,
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
    cancel: CancellationToken,
    /// Held by `start` from leaving Idle until it has settled.
    startup: AsyncMutex<()>,
    accept_loops: TaskTracker,
    connections: TaskTracker,
}

impl std::fmt::Debug for RunningTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningTunnel")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}

impl RunningTunnel {
    pub fn new(
        config: TunnelConfig,
        pool: Arc<ConnectionPool>,
        connector: Arc<dyn Connector>,
        settings: EngineSettings,
        events: broadcast::Sender<TunnelEvent>,
    ) -> Self {
        let shared = Arc::new(TunnelShared {
            name: Arc::from(config.name.as_str()),
            state: Mutex::new(TunnelState {
                status: Status::Stopped,
                error: None,
                heartbeat: None,
                heartbeat_at: None,
                phase: Phase::Idle,
            }),
            events,
        });

        Self {
            config,
            shared,
            pool,
            connector,
            settings,
            cancel: CancellationToken::new(),
            startup: AsyncMutex::new(()),
            accept_loops: TaskTracker::new(),
            connections: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.shared.lock().status
    }

    pub fn error(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    /// Local addresses actually bound, in forward order. Empty unless
    /// running. Remote forwards report the server-side address.
    pub fn bound_addresses(&self) -> Vec<String> {
        match &self.shared.lock().phase {
            Phase::Running(resources) => resources
                .listeners
                .iter()
                .map(|listener| listener.local_addr())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.shared.lock();
        TunnelSnapshot {
            name: self.config.name.clone(),
            status: state.status,
            error: state.error.clone(),
            last_heartbeat: state.heartbeat_at,
            forwards: self.config.forwards.clone(),
        }
    }

    /// True once the tunnel can no longer change by itself: it failed to
    /// start or has been stopped.
    pub fn is_finished(&self) -> bool {
        matches!(self.shared.lock().phase, Phase::Failed | Phase::Finished)
    }

    /// Connect, bind every forward, then start serving.
    ///
    /// Either every forward is up and the tunnel is Connected, or nothing
    /// is left behind and the tunnel is in Error. A tunnel can be started
    /// once.
    pub async fn start(&self, two_factor_code: Option<&str>) -> Result<(), TunnelError> {
        let _startup = {
            let mut state = self.shared.lock();
            if !matches!(state.phase, Phase::Idle) {
                return Err(TunnelError::AlreadyRunning(self.config.name.clone()));
            }
            // Only the call leaving Idle takes it, so it is always free here.
            let startup = self
                .startup
                .try_lock()
                .map_err(|_| TunnelError::AlreadyRunning(self.config.name.clone()))?;
            state.phase = Phase::Starting;
            self.shared.transition(&mut state, Status::Connecting, None);
            startup
        };
        info!("[{}] Starting tunnel", self.config.name);

        match self.establish(two_factor_code).await {
            Ok((resources, routes)) => self.activate(resources, routes).await,
            Err(e) => {
                let mut state = self.shared.lock();
                if matches!(state.phase, Phase::Starting) {
                    state.phase = Phase::Failed;
                    self.shared
                        .transition(&mut state, Status::Error, Some(e.to_string()));
                    warn!("[{}] Failed to start: {}", self.config.name, e);
                }
                Err(e)
            }
        }
    }

    /// Acquire the session and bind all forwards. On failure everything
    /// acquired so far is given back.
    async fn establish(
        &self,
        two_factor_code: Option<&str>,
    ) -> Result<(Resources, Vec<Route>), TunnelError> {
        self.config.validate()?;
        let routes = self
            .config
            .forwards
            .iter()
            .map(|forward| {
                Route::for_forward(forward).map_err(|e| TunnelError::Forward {
                    forward: forward.to_string(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let identity = SessionIdentity::from(&self.config);
        let acquire = self.pool.acquire(&identity, || {
            self.connector
                .connect(&self.config, two_factor_code, &self.settings)
        });
        // The pool records a session only after the dial completes.
        let transport = tokio::select! {
            result = acquire => result?,
            _ = self.cancel.cancelled() => return Err(TunnelError::Stopped),
        };

        let mut listeners: Vec<Arc<dyn ForwardListener>> = Vec::new();
        for forward in &self.config.forwards {
            let bound = if self.cancel.is_cancelled() {
                Err(io::Error::new(io::ErrorKind::Interrupted, "tunnel stopped"))
            } else {
                bind_forward(forward, &transport).await
            };
            match bound {
                Ok(listener) => {
                    debug!(
                        "[{}] Bound {} on {}",
                        self.config.name,
                        forward,
                        listener.local_addr()
                    );
                    listeners.push(listener);
                }
                Err(source) => {
                    for listener in &listeners {
                        listener.close().await;
                    }
                    self.pool.release(&identity).await;
                    if self.cancel.is_cancelled() {
                        return Err(TunnelError::Stopped);
                    }
                    return Err(TunnelError::Forward {
                        forward: forward.to_string(),
                        source,
                    });
                }
            }
        }

        Ok((
            Resources {
                identity,
                transport,
                listeners,
            },
            routes,
        ))
    }

    /// Publish the resources and spawn the accept loops, unless a stop got
    /// in first.
    async fn activate(&self, resources: Resources, routes: Vec<Route>) -> Result<(), TunnelError> {
        let unwanted = {
            let mut state = self.shared.lock();
            if matches!(state.phase, Phase::Starting) {
                // Spawned under the lock so a concurrent stop sees them.
                for (listener, route) in resources.listeners.iter().zip(routes) {
                    let ctx = self.forward_context(&resources.transport);
                    spawn_tracked(
                        &self.accept_loops,
                        format!("{}:{}", self.config.name, listener.local_addr()),
                        run_accept_loop(listener.clone(), route, ctx),
                    );
                }
                state.touch();
                state.phase = Phase::Running(resources);
                self.shared.transition(&mut state, Status::Connected, None);
                None
            } else {
                Some(resources)
            }
        };

        match unwanted {
            None => {
                info!(
                    "[{}] Connected with {} forward(s)",
                    self.config.name,
                    self.config.forwards.len()
                );
                Ok(())
            }
            Some(resources) => {
                debug!("[{}] Stopped while starting, unwinding", self.config.name);
                release(&self.pool, resources).await;
                Err(TunnelError::Stopped)
            }
        }
    }

    fn forward_context(&self, transport: &SharedTransport) -> ForwardContext {
        ForwardContext {
            tunnel: self.shared.name.clone(),
            transport: transport.clone(),
            cancel: self.cancel.clone(),
            connections: self.connections.clone(),
            stop: self.shared.clone(),
            socks_handshake_timeout: self.settings.socks_handshake_timeout(),
            dial_timeout: self.settings.connect_timeout(),
        }
    }

    /// Stop the tunnel. Safe to call any number of times, from any state.
    ///
    /// Listeners are closed and the session lease returned by whichever
    /// call gets here first. Every call returns once an interrupted start
    /// has unwound and the accept loops have exited, so the bound ports are
    /// free again.
    pub async fn stop(&self) {
        let taken = {
            let mut state = self.shared.lock();
            match std::mem::replace(&mut state.phase, Phase::Finished) {
                Phase::Finished => None,
                previous => {
                    self.shared.transition(&mut state, Status::Stopped, None);
                    Some(previous)
                }
            }
        };

        if let Some(previous) = taken {
            info!("[{}] Stopping tunnel", self.config.name);
            if let Phase::Running(resources) = previous {
                release(&self.pool, resources).await;
            }
            self.cancel.cancel();
            self.accept_loops.close();
            self.connections.close();
        }

        drop(self.startup.lock().await);
        self.accept_loops.wait().await;
    }

    /// Re-check liveness of a connected tunnel.
    ///
    /// Probes when the last heartbeat is older than the configured
    /// threshold, or right away when the session already reports itself
    /// closed. Returns the status after the check.
    pub async fn check_health(&self) -> Status {
        let threshold = self.settings.heartbeat_threshold();
        let transport = {
            let state = self.shared.lock();
            let Phase::Running(resources) = &state.phase else {
                return state.status;
            };
            if state.status != Status::Connected {
                return state.status;
            }
            let stale = state
                .heartbeat
                .map_or(true, |beat| beat.elapsed() >= threshold);
            if !stale && !resources.transport.is_closed() {
                return state.status;
            }
            resources.transport.clone()
        };

        let probe_timeout = self.settings.probe_timeout();
        let outcome = match timeout(probe_timeout, transport.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("Connection lost: {e}")),
            Err(_) => Err(format!(
                "Connection lost: no response within {}s",
                probe_timeout.as_secs()
            )),
        };

        let mut state = self.shared.lock();
        // A stop may have landed while probing.
        if !matches!(state.phase, Phase::Running(_)) || state.status != Status::Connected {
            return state.status;
        }
        match outcome {
            Ok(()) => {
                debug!("[{}] Liveness probe ok", self.config.name);
                state.touch();
            }
            Err(message) => {
                warn!("[{}] {}", self.config.name, message);
                self.shared
                    .transition(&mut state, Status::Disconnected, Some(message));
            }
        }
        state.status
    }

    /// Pretend the last heartbeat happened `age` ago.
    #[cfg(test)]
    fn age_heartbeat(&self, age: std::time::Duration) {
        let mut state = self.shared.lock();
        state.heartbeat = Instant::now().checked_sub(age);
    }
}

async fn release(pool: &ConnectionPool, resources: Resources) {
    for listener in &resources.listeners {
        listener.close().await;
    }
    pool.release(&resources.identity).await;
}

impl Drop for RunningTunnel {
    fn drop(&mut self) {
        // Accept loops end with the token; listeners and the lease are
        // reclaimed by the pool's own shutdown.
        self.cancel.cancel();
    }
}
