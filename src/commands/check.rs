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

/// Validate every tunnel and print the verdicts. Returns the number of
/// tunnels with problems.
pub fn check_tunnels(config: &Config) -> usize {
    let mut failures = 0;
    for tunnel in &config.tunnels {
        match tunnel.validate() {
            Ok(()) => println!("{} {}", "✓".green(), tunnel.name),
            Err(e) => {
                failures += 1;
                println!("{} {}: {}", "✗".red(), tunnel.name.bold(), e);
            }
        }
    }
    if let Err(e) = config.validate() {
        // Per-tunnel problems were already reported above.
        if failures == 0 {
            failures += 1;
            println!("{} {}", "✗".red(), e);
        }
    }

    if failures == 0 {
        println!(
            "\n{} {} tunnel(s) OK",
            "●".green(),
            config.tunnels.len()
        );
    } else {
        println!("\n{} {} problem(s) found", "●".red(), failures);
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_counted() {
        let config = Config::parse(
            r#"
tunnels:
  - name: web
    ssh_host: a.example.com
    auth: { user: alice, password: pw }
  - name: web
    ssh_host: b.example.com
    auth: { user: bob, password: pw }
"#,
        )
        .unwrap();
        assert_eq!(check_tunnels(&config), 1);
    }

    #[test]
    fn test_invalid_tunnel_counted() {
        let config = Config::parse(
            r#"
- name: broken
  ssh_host: ""
  auth: { user: alice }
- name: fine
  ssh_host: c.example.com
  auth: { user: carol, password: pw }
"#,
        )
        .unwrap();
        assert_eq!(check_tunnels(&config), 1);
    }
}
