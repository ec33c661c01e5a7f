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

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sshtm",
    version,
    about = "SSH tunnel manager - local, remote and SOCKS5 forwards over shared SSH sessions",
    after_help = "EXAMPLES:\n  List configured tunnels:     sshtm list\n  Validate the configuration:  sshtm check\n  Bring every tunnel up:       sshtm up\n  Bring selected tunnels up:   sshtm -v up web db"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        env = "SSHTM_CONFIG",
        help = "Tunnel configuration file\nDefaults to <config dir>/sshtm/tunnels.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "List configured tunnels and their forwards")]
    List,

    #[command(about = "Validate every configured tunnel")]
    Check,

    #[command(about = "Start tunnels and keep them up until Ctrl-C")]
    Up {
        #[arg(help = "Tunnels to start (all when omitted)")]
        names: Vec<String>,
    },
}
