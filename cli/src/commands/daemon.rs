// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon lifecycle commands
//!
//! Commands: start, status. The daemon runs in the foreground; process
//! supervision (systemd or similar) owns restarts and backgrounding.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run the gateway daemon in the foreground
    Start,

    /// Query a running daemon's health endpoint
    Status,
}

pub async fn handle_command(
    command: DaemonCommand,
    config_path: Option<PathBuf>,
    host: &str,
    port: u16,
) -> Result<()> {
    match command {
        DaemonCommand::Start => crate::daemon::start_daemon(config_path, host, port).await,

        DaemonCommand::Status => {
            let client = GatewayClient::new(format!("http://{}:{}", host, port))?;
            match client.gateway_health().await {
                Ok(health) => {
                    println!("{}", "Gateway is running".green());
                    println!(
                        "Uptime: {}s, devices: {}",
                        health["uptime_seconds"].as_u64().unwrap_or(0),
                        health["devices"].as_u64().unwrap_or(0)
                    );
                    Ok(())
                }
                Err(e) => {
                    println!("{}", "Gateway is not reachable".red());
                    println!("{:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
