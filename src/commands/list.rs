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

use owo_colors::OwoColorize;

use crate::config::Config;

pub fn list_tunnels(config: &Config) {
    if config.tunnels.is_empty() {
        println!("{}", "No tunnels configured".dimmed());
        return;
    }

    println!("\n{} {}\n", "▶".cyan(), "Configured tunnels".bold());
    for tunnel in &config.tunnels {
        let via = tunnel
            .active_proxy()
            .map(|proxy| format!(" via {}:{}", proxy.host, proxy.port))
            .unwrap_or_default();
        println!(
            "  {} {} {}@{}:{}{}{}",
            "●".blue(),
            tunnel.name.bold(),
            tunnel.auth.user,
            tunnel.ssh_host,
            tunnel.ssh_port,
            via.dimmed(),
            if tunnel.auth.use_2fa { " (2FA)" } else { "" }.yellow()
        );
        if tunnel.forwards.is_empty() {
            println!("    {} {}", "•".dimmed(), "no forwards".dimmed());
        }
        for forward in &tunnel.forwards {
            println!("    {} {}", "•".dimmed(), forward.to_string().dimmed());
        }
    }
    println!();
}
