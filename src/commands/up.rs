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

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use futures::future::join_all;
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::config::{Config, TunnelConfig};
use crate::tunnel::{Status, TunnelEvent, TunnelManager};
use crate::utils::spawn_guarded;

/// Start the selected tunnels and keep them up until Ctrl-C.
pub async fn bring_up(config: &Config, names: &[String]) -> Result<()> {
    let selected = select_tunnels(config, names)?;
    if selected.is_empty() {
        println!("{}", "No tunnels configured".dimmed());
        return Ok(());
    }

    // Ask for every code up front so prompts don't interleave with status
    // output.
    let mut codes: HashMap<&str, Zeroizing<String>> = HashMap::new();
    for tunnel in selected.iter().filter(|t| t.auth.use_2fa) {
        codes.insert(tunnel.name.as_str(), prompt_code(tunnel)?);
    }

    let session = Session::begin(Arc::new(TunnelManager::new(config.settings.clone())));

    let results = join_all(selected.iter().map(|tunnel| {
        let code = codes.get(tunnel.name.as_str()).map(|code| code.as_str());
        session.manager.start((*tunnel).clone(), code)
    }))
    .await;
    drop(codes);
    let started = results.iter().filter(|result| result.is_ok()).count();
    drop(results);

    if started > 0 {
        println!(
            "\n{} {} of {} tunnel(s) up. Press Ctrl-C to stop.\n",
            "▶".cyan(),
            started.to_string().green(),
            selected.len()
        );
        if let Err(e) = tokio::signal::ctrl_c().await {
            session.end().await;
            return Err(e).context("Failed to listen for Ctrl-C");
        }
        println!();
    }

    session.end().await;

    if started == 0 {
        bail!("None of the selected tunnels could be started");
    }
    Ok(())
}

/// The tunnel manager plus the background tasks `up` runs beside it.
struct Session {
    manager: Arc<TunnelManager>,
    health_cancel: CancellationToken,
    health: JoinHandle<()>,
    printer_done: CancellationToken,
    printer: JoinHandle<()>,
}

impl Session {
    fn begin(manager: Arc<TunnelManager>) -> Self {
        let printer_done = CancellationToken::new();
        let printer = spawn_event_printer(manager.subscribe(), printer_done.clone());
        let health_cancel = CancellationToken::new();
        let health = manager.spawn_health_monitor(health_cancel.clone());
        Self {
            manager,
            health_cancel,
            health,
            printer_done,
            printer,
        }
    }

    /// Stop every tunnel, then the printer once it has shown the final
    /// status changes.
    ///
    /// Tunnels keep a sender of the event channel, so the printer cannot
    /// wait for the channel to close while anyone still holds one.
    async fn end(self) {
        self.health_cancel.cancel();
        let _ = self.health.await;
        self.manager.stop_all().await;
        self.printer_done.cancel();
        let _ = self.printer.await;
    }
}

fn spawn_event_printer(
    mut events: broadcast::Receiver<TunnelEvent>,
    done: CancellationToken,
) -> JoinHandle<()> {
    spawn_guarded("event-printer", async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Event printer skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = done.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        print_event(&event);
                    }
                    break;
                }
            }
        }
    })
}

fn select_tunnels<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a TunnelConfig>> {
    if names.is_empty() {
        return Ok(config.tunnels.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            config
                .tunnel(name)
                .ok_or_else(|| anyhow!("No tunnel named '{name}' in the configuration"))
        })
        .collect()
}

fn prompt_code(tunnel: &TunnelConfig) -> Result<Zeroizing<String>> {
    let code = Zeroizing::new(
        rpassword::prompt_password(format!(
            "Verification code for {} ({}@{}): ",
            tunnel.name, tunnel.auth.user, tunnel.ssh_host
        ))
        .with_context(|| "Failed to read verification code")?,
    );
    let trimmed = Zeroizing::new(code.trim().to_string());
    if trimmed.is_empty() {
        bail!("Verification code for '{}' must not be empty", tunnel.name);
    }
    Ok(trimmed)
}

fn print_event(event: &TunnelEvent) {
    let time = Local::now().format("%H:%M:%S");
    let status = match event.status {
        Status::Connected => event.status.to_string().green().to_string(),
        Status::Connecting => event.status.to_string().cyan().to_string(),
        Status::Disconnected => event.status.to_string().yellow().to_string(),
        Status::Error => event.status.to_string().red().to_string(),
        Status::Stopped => event.status.to_string().dimmed().to_string(),
    };
    match &event.error {
        Some(error) => println!("{} {} {}: {}", time.dimmed(), event.name.bold(), status, error),
        None => println!("{} {} {}", time.dimmed(), event.name.bold(), status),
    }
}
