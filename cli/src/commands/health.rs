// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Health monitor administration
//!
//! Commands: status, probe

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum HealthCommand {
    /// Show every monitored target
    Status,

    /// Probe a target immediately (bypasses backoff; recovers degraded
    /// targets)
    Probe {
        /// Target name
        #[arg(value_name = "TARGET")]
        target: String,
    },
}

pub async fn handle_command(command: HealthCommand, base_url: &str) -> Result<()> {
    let client = GatewayClient::new(base_url)?;

    match command {
        HealthCommand::Status => {
            let body = client.health_targets().await?;
            let targets = body["targets"].as_array().cloned().unwrap_or_default();
            if targets.is_empty() {
                println!("{}", "No health targets configured".yellow());
                return Ok(());
            }
            println!(
                "{:<24} {:<12} {:>9} {:>9}",
                "TARGET".bold(),
                "PHASE".bold(),
                "FAILURES".bold(),
                "RESTARTS".bold()
            );
            for target in targets {
                let phase = target["phase"].as_str().unwrap_or("?");
                let colored_phase = match phase {
                    "healthy" => phase.green(),
                    "failing" | "recovering" => phase.yellow(),
                    _ => phase.red(),
                };
                println!(
                    "{:<24} {:<12} {:>9} {:>9}",
                    target["target"].as_str().unwrap_or("?"),
                    colored_phase,
                    target["consecutive_failures"].as_u64().unwrap_or(0),
                    target["restarts"].as_u64().unwrap_or(0)
                );
            }
            Ok(())
        }

        HealthCommand::Probe { target } => {
            let report = client.probe_target(&target).await?;
            let phase = report["phase"].as_str().unwrap_or("?");
            let verdict = if phase == "healthy" {
                phase.green()
            } else {
                phase.red()
            };
            println!("{}: {}", target, verdict);
            Ok(())
        }
    }
}
