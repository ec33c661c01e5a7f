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

use anyhow::Result;
use clap::Parser;

use sshtm::{
    cli::{Cli, Commands},
    commands::{check::check_tunnels, list::list_tunnels, up::bring_up},
    config::Config,
    utils::init_logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    tracing::debug!("Using configuration {}", config_path.display());
    let config = Config::load(&config_path).await?;

    match cli.command {
        Commands::List => list_tunnels(&config),
        Commands::Check => {
            if check_tunnels(&config) > 0 {
                std::process::exit(1);
            }
        }
        Commands::Up { names } => {
            config.validate()?;
            bring_up(&config, &names).await?;
        }
    }
    Ok(())
}
