// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "multicam")]
#[command(about = "Logical multi-camera orchestration")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    /// Configuration file (default: ~/.config/multicam/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the zoom zones computed for the configured cameras
    Zones,

    /// Run a zoom sweep against software pipelines
    Simulate {
        /// Number of logical frames to submit
        #[arg(short, long, default_value = "120")]
        frames: u64,

        /// Zoom ratio of the first frame
        #[arg(long, default_value = "1.0")]
        zoom_from: f32,

        /// Zoom ratio of the last frame
        #[arg(long, default_value = "4.0")]
        zoom_to: f32,

        /// Scene lux index reported by the pipelines
        #[arg(short, long, default_value = "50.0")]
        lux: f32,

        /// Delay between submitted frames in milliseconds
        #[arg(short, long, default_value = "33")]
        interval: u64,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(short, long)]
        write: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=multicam=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Zones) | None => cli::print_zones(&config),
        Some(Commands::Simulate {
            frames,
            zoom_from,
            zoom_to,
            lux,
            interval,
        }) => cli::simulate(
            &config,
            cli::SimulateOptions {
                frames,
                zoom_from,
                zoom_to,
                lux,
                interval_ms: interval,
            },
        ),
        Some(Commands::Config { write }) => cli::show_config(&config, cli.config, write),
    }
}
