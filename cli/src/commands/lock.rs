// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource lock administration
//!
//! Commands: list, acquire, release, force-release

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use uuid::Uuid;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum LockCommand {
    /// List live locks
    List,

    /// Acquire a lock (fails fast when held)
    Acquire {
        /// Resource id
        #[arg(value_name = "RESOURCE")]
        resource_id: String,

        /// Holder identity recorded on the lock
        #[arg(short = 'H', long, default_value = "cli")]
        holder: String,
    },

    /// Release a lock with its token
    Release {
        /// Resource id
        #[arg(value_name = "RESOURCE")]
        resource_id: String,

        /// Ownership token returned by acquire
        #[arg(value_name = "TOKEN")]
        token: Uuid,
    },

    /// Force-release a lock without a token (audited)
    ForceRelease {
        /// Resource id
        #[arg(value_name = "RESOURCE")]
        resource_id: String,
    },
}

pub async fn handle_command(command: LockCommand, base_url: &str) -> Result<()> {
    let client = GatewayClient::new(base_url)?;

    match command {
        LockCommand::List => {
            let body = client.list_locks().await?;
            let locks = body["locks"].as_array().cloned().unwrap_or_default();
            if locks.is_empty() {
                println!("{}", "No live locks".yellow());
                return Ok(());
            }
            println!(
                "{:<28} {:<20} {}",
                "RESOURCE".bold(),
                "HOLDER".bold(),
                "ACQUIRED".bold()
            );
            for lock in locks {
                println!(
                    "{:<28} {:<20} {}",
                    lock["resource_id"].as_str().unwrap_or("?"),
                    lock["holder_id"].as_str().unwrap_or("?"),
                    lock["acquired_at"].as_str().unwrap_or("?")
                );
            }
            Ok(())
        }

        LockCommand::Acquire {
            resource_id,
            holder,
        } => {
            let token = client.acquire_lock(&resource_id, &holder).await?;
            println!("{} {}", "Acquired".green(), resource_id);
            println!("Token: {}", token);
            Ok(())
        }

        LockCommand::Release { resource_id, token } => {
            client.release_lock(&resource_id, token).await?;
            println!("{} {}", "Released".green(), resource_id);
            Ok(())
        }

        LockCommand::ForceRelease { resource_id } => {
            client.force_release_lock(&resource_id).await?;
            println!("{} {}", "Force-released".yellow(), resource_id);
            Ok(())
        }
    }
}
