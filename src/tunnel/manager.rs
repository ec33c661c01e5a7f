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

//! Registry of tunnels by name.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{HealthMonitor, RunningTunnel, TunnelError, TunnelEvent, TunnelSnapshot};
use crate::config::{EngineSettings, TunnelConfig};
use crate::ssh::{ConnectionPool, Connector, SshConnector};

/// Capacity of the status event channel. Slow subscribers skip events.
const EVENT_CAPACITY: usize = 256;

/// Starts, stops and tracks tunnels that share one connection pool.
pub struct TunnelManager {
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
    tunnels: RwLock<HashMap<String, Arc<RunningTunnel>>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelManager {
    /// A manager that dials real SSH servers.
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_connector(settings, Arc::new(SshConnector))
    }

    pub fn with_connector(settings: EngineSettings, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool: Arc::new(ConnectionPool::new()),
            connector,
            settings,
            tunnels: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Start `config` under its name.
    ///
    /// Refused while a tunnel of that name is starting or running. A
    /// stopped or failed entry of the same name is replaced. A tunnel that
    /// fails to start stays registered so its error can be queried.
    pub async fn start(
        &self,
        config: TunnelConfig,
        two_factor_code: Option<&str>,
    ) -> Result<Arc<RunningTunnel>, TunnelError> {
        let name = config.name.clone();
        let tunnel = Arc::new(RunningTunnel::new(
            config,
            self.pool.clone(),
            self.connector.clone(),
            self.settings.clone(),
            self.events.clone(),
        ));

        let replaced = {
            let mut tunnels = self.tunnels.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = tunnels.get(&name) {
                if !existing.is_finished() {
                    return Err(TunnelError::AlreadyRunning(name));
                }
            }
            tunnels.insert(name, tunnel.clone())
        };
        if let Some(previous) = replaced {
            previous.stop().await;
        }

        tunnel.start(two_factor_code).await?;
        Ok(tunnel)
    }

    /// Stop the named tunnel and forget it.
    pub async fn stop(&self, name: &str) -> Result<(), TunnelError> {
        let tunnel = self
            .tunnels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| TunnelError::NotFound(name.to_string()))?;
        tunnel.stop().await;
        Ok(())
    }

    /// Stop every tunnel, then close whatever the pool still holds.
    pub async fn stop_all(&self) {
        let tunnels: Vec<_> = self
            .tunnels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, tunnel)| tunnel)
            .collect();
        tracing::info!("Stopping {} tunnel(s)", tunnels.len());
        join_all(tunnels.iter().map(|tunnel| tunnel.stop())).await;
        self.pool.close_all().await;
    }

    pub fn get(&self, name: &str) -> Option<Arc<RunningTunnel>> {
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered tunnels, cloned out of the registry.
    pub fn tunnels(&self) -> Vec<Arc<RunningTunnel>> {
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<TunnelSnapshot> {
        self.get(name).map(|tunnel| tunnel.snapshot())
    }

    /// Snapshots of every registered tunnel, sorted by name.
    pub fn snapshots(&self) -> Vec<TunnelSnapshot> {
        let mut snapshots: Vec<_> = self
            .tunnels()
            .iter()
            .map(|tunnel| tunnel.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Run the health monitor over this manager's tunnels until `cancel`
    /// fires.
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        HealthMonitor::new(self.clone()).spawn(cancel)
    }
}
