// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tilestore CLI
//!
//! Replays recorded commits and test results through the trace store and
//! prints the resulting tile as JSON.

mod replay;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replay::{replay, Fixture, ReplayOptions};
use std::path::PathBuf;
use tilestore_core::TraceStoreConfig;
use tilestore_telemetry::{init_logging, LogFormat};
use tracing::debug;

#[derive(Parser)]
#[command(name = "tilestore")]
#[command(about = "Tilestore - time-windowed trace storage", long_about = None)]
struct Cli {
    /// Log output format (text or json)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fixture into an in-memory store and read a tile back
    Replay {
        /// Fixture JSON with commits and results
        #[arg(short, long)]
        input: PathBuf,

        /// Engine settings (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of commits to read (default: whole history)
        #[arg(long)]
        commits: Option<usize>,

        /// Only return commits that have data
        #[arg(long)]
        dense: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    init_logging(cli.log_format, level).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Replay {
            input,
            config,
            commits,
            dense,
        } => {
            let config = match config {
                Some(path) => TraceStoreConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => TraceStoreConfig::default(),
            };
            debug!(tile_size = config.tile_size, shards = config.shards, "config loaded");

            let fixture = Fixture::from_file(&input)?;
            let report = replay(config, fixture, ReplayOptions { commits, dense }).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
