// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Fleet Gateway CLI
//!
//! The `aegis-fleet` binary runs the gateway daemon and administers a
//! running one over its HTTP API.
//!
//! ## Commands
//!
//! - `aegis-fleet daemon start|status` - Run/inspect the gateway daemon
//! - `aegis-fleet device list|show|register|remove` - Device registry
//! - `aegis-fleet task submit|status|list|cancel` - Task routing
//! - `aegis-fleet lock list|acquire|release|force-release` - Resource locks
//! - `aegis-fleet transfer send|status|resume|list` - Bulk transfers
//! - `aegis-fleet health status|probe` - Health monitor

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod client;
mod commands;
mod daemon;

use commands::{DeviceCommand, HealthCommand, LockCommand, TaskCommand, TransferCommand};

/// AEGIS Fleet Gateway - orchestrate a heterogeneous device fleet
#[derive(Parser)]
#[command(name = "aegis-fleet")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to gateway configuration manifest (YAML)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_FLEET_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Gateway API host
    #[arg(long, global = true, env = "AEGIS_FLEET_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Gateway API port
    #[arg(long, global = true, env = "AEGIS_FLEET_PORT", default_value = "8700")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AEGIS_FLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect the gateway daemon
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: commands::daemon::DaemonCommand,
    },

    /// Device registry operations
    #[command(name = "device")]
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },

    /// Task submission and tracking
    #[command(name = "task")]
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Resource lock administration
    #[command(name = "lock")]
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },

    /// Bulk payload transfers
    #[command(name = "transfer")]
    Transfer {
        #[command(subcommand)]
        command: TransferCommand,
    },

    /// Health monitor administration
    #[command(name = "health")]
    Health {
        #[command(subcommand)]
        command: HealthCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let base_url = format!("http://{}:{}", cli.host, cli.port);
    match cli.command {
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config, &cli.host, cli.port).await
        }
        Some(Commands::Device { command }) => {
            commands::device::handle_command(command, &base_url).await
        }
        Some(Commands::Task { command }) => {
            commands::task::handle_command(command, &base_url).await
        }
        Some(Commands::Lock { command }) => {
            commands::lock::handle_command(command, &base_url).await
        }
        Some(Commands::Transfer { command }) => {
            commands::transfer::handle_command(command, &base_url).await
        }
        Some(Commands::Health { command }) => {
            commands::health::handle_command(command, &base_url).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
