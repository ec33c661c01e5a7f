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

//! Periodic liveness checks of connected tunnels.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Status, TunnelManager};
use crate::utils::spawn_guarded;

/// Polls every registered tunnel on a fixed interval.
///
/// Each round works on a snapshot of the registry, so tunnels started or
/// stopped meanwhile are picked up next round. Tunnels are checked
/// concurrently.
pub struct HealthMonitor {
    manager: Arc<TunnelManager>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(manager: Arc<TunnelManager>) -> Self {
        let interval = manager.settings().health_interval();
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Check every tunnel once. Returns how many are disconnected after
    /// the round.
    pub async fn check_once(&self) -> usize {
        let tunnels = self.manager.tunnels();
        trace!("Health check over {} tunnel(s)", tunnels.len());
        join_all(tunnels.iter().map(|tunnel| tunnel.check_health()))
            .await
            .into_iter()
            .filter(|status| *status == Status::Disconnected)
            .count()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let disconnected = self.check_once().await;
                    if disconnected > 0 {
                        debug!("{} tunnel(s) disconnected", disconnected);
                    }
                }
            }
        }
        debug!("Health monitor stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_guarded("health-monitor", self.run(cancel))
    }
}
