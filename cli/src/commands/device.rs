// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Device registry commands
//!
//! Commands: list, show, register, remove

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum DeviceCommand {
    /// List registered devices
    List,

    /// Show one device record
    Show {
        /// Device id
        #[arg(value_name = "DEVICE_ID")]
        device_id: String,
    },

    /// Register a device out of band (devices normally self-register)
    Register {
        /// Device id
        #[arg(value_name = "DEVICE_ID")]
        device_id: String,

        /// Device type (desktop, mobile, iot, simulated)
        #[arg(short = 't', long, default_value = "iot")]
        device_type: String,

        /// Capability tags (repeatable)
        #[arg(short = 'c', long = "capability", value_name = "TAG")]
        capabilities: Vec<String>,

        /// Agent endpoint base URL
        #[arg(short, long, value_name = "URL")]
        endpoint: String,
    },

    /// Deregister a device (administrative removal)
    Remove {
        /// Device id
        #[arg(value_name = "DEVICE_ID")]
        device_id: String,
    },
}

pub async fn handle_command(command: DeviceCommand, base_url: &str) -> Result<()> {
    let client = GatewayClient::new(base_url)?;

    match command {
        DeviceCommand::List => {
            let body = client.list_devices().await?;
            let devices = body["devices"].as_array().cloned().unwrap_or_default();
            if devices.is_empty() {
                println!("{}", "No devices registered".yellow());
                return Ok(());
            }
            println!(
                "{:<24} {:<10} {:<10} {:>6}  {}",
                "DEVICE".bold(),
                "TYPE".bold(),
                "STATUS".bold(),
                "LOAD".bold(),
                "CAPABILITIES".bold()
            );
            for device in devices {
                let caps = device["capabilities"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|c| c.as_str())
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                let status = device["status"].as_str().unwrap_or("?");
                let colored_status = match status {
                    "online" => status.green(),
                    "degraded" => status.yellow(),
                    _ => status.red(),
                };
                println!(
                    "{:<24} {:<10} {:<10} {:>6.1}  {}",
                    device["id"].as_str().unwrap_or("?"),
                    device["device_type"].as_str().unwrap_or("?"),
                    colored_status,
                    device["load_score"].as_f64().unwrap_or(0.0),
                    caps
                );
            }
            Ok(())
        }

        DeviceCommand::Show { device_id } => {
            let device = client.get_device(&device_id).await?;
            println!("{}", serde_json::to_string_pretty(&device)?);
            Ok(())
        }

        DeviceCommand::Register {
            device_id,
            device_type,
            capabilities,
            endpoint,
        } => {
            if capabilities.is_empty() {
                anyhow::bail!("At least one --capability is required");
            }
            let registration = serde_json::json!({
                "device_id": device_id,
                "device_type": device_type,
                "capabilities": capabilities,
                "endpoint": endpoint,
            });
            let registered = client
                .register_device(registration)
                .await
                .context("Registration failed")?;
            println!("{} {}", "Registered".green(), registered);
            Ok(())
        }

        DeviceCommand::Remove { device_id } => {
            client.remove_device(&device_id).await?;
            println!("{} {}", "Removed".green(), device_id);
            Ok(())
        }
    }
}
