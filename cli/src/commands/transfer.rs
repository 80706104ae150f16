// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bulk transfer commands
//!
//! Commands: send, status, resume, list

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use uuid::Uuid;

use aegis_fleet_core::domain::transfer::digest_hex;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum TransferCommand {
    /// Send a file through the gateway, chunk by chunk
    Send {
        /// Payload file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Sending device id
        #[arg(short, long, default_value = "cli")]
        source: String,

        /// Receiving device id
        #[arg(short, long)]
        target: String,
    },

    /// Show one transfer session
    Status {
        /// Transfer id
        #[arg(value_name = "TRANSFER_ID")]
        transfer_id: Uuid,
    },

    /// Resume an interrupted transfer from the gateway's frontier
    Resume {
        /// Transfer id
        #[arg(value_name = "TRANSFER_ID")]
        transfer_id: Uuid,
    },

    /// List transfer sessions
    List,
}

pub async fn handle_command(command: TransferCommand, base_url: &str) -> Result<()> {
    let client = GatewayClient::new(base_url)?;

    match command {
        TransferCommand::Send {
            file,
            source,
            target,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "payload".to_string());

            let transfer_id = client
                .open_transfer(serde_json::json!({
                    "name": name,
                    "total_size": data.len() as u64,
                    "checksum": digest_hex(&data),
                    "source_id": source,
                    "target_id": target,
                }))
                .await?;
            println!("{} {} ({} bytes)", "Opened".green(), transfer_id, data.len());

            let status = client.transfer_status(transfer_id).await?;
            let chunk_size = status["chunk_size"].as_u64().unwrap_or(64 * 1024) as usize;

            upload_from(&client, transfer_id, &data, chunk_size, 0).await?;

            let done = client.complete_transfer(transfer_id).await?;
            println!(
                "{} {} bytes delivered",
                "Complete".green(),
                done["bytes"].as_u64().unwrap_or(0)
            );
            Ok(())
        }

        TransferCommand::Status { transfer_id } => {
            let status = client.transfer_status(transfer_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        TransferCommand::Resume { transfer_id } => {
            let offset = client.resume_transfer(transfer_id).await?;
            println!("{} from offset {}", "Resuming".cyan(), offset);
            Ok(())
        }

        TransferCommand::List => {
            let body = client.list_transfers().await?;
            let transfers = body["transfers"].as_array().cloned().unwrap_or_default();
            if transfers.is_empty() {
                println!("{}", "No transfer sessions".yellow());
                return Ok(());
            }
            println!(
                "{:<38} {:<22} {:<12} {:<12} {}",
                "TRANSFER".bold(),
                "NAME".bold(),
                "STATE".bold(),
                "MODE".bold(),
                "PROGRESS".bold()
            );
            for transfer in transfers {
                println!(
                    "{:<38} {:<22} {:<12} {:<12} {}/{}",
                    transfer["id"].as_str().unwrap_or("?"),
                    transfer["name"].as_str().unwrap_or("?"),
                    transfer["state"].as_str().unwrap_or("?"),
                    transfer["transport_mode"].as_str().unwrap_or("?"),
                    transfer["resume_offset"].as_u64().unwrap_or(0),
                    transfer["total_size"].as_u64().unwrap_or(0)
                );
            }
            Ok(())
        }
    }
}

/// Upload chunks starting at `offset`, per-chunk checksummed
async fn upload_from(
    client: &GatewayClient,
    transfer_id: Uuid,
    data: &[u8],
    chunk_size: usize,
    offset: u64,
) -> Result<()> {
    let start_index = offset as usize / chunk_size;
    let chunk_count = data.len().div_ceil(chunk_size);
    for index in start_index..chunk_count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let chunk = Bytes::copy_from_slice(&data[start..end]);
        let checksum = digest_hex(&chunk);
        client
            .upload_chunk(transfer_id, index, chunk, &checksum)
            .await?;
    }
    Ok(())
}
