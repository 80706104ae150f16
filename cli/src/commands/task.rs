// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Task routing commands
//!
//! Commands: submit, status, list, cancel

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::client::GatewayClient;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Submit a task described by a YAML file
    Submit {
        /// Path to task YAML ({ goal, subtasks: [...] })
        #[arg(value_name = "TASK_FILE")]
        task_file: PathBuf,

        /// Poll until the task reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Show one task with its per-subtask breakdown
    Status {
        /// Task id
        #[arg(value_name = "TASK_ID")]
        task_id: Uuid,
    },

    /// List known tasks
    List,

    /// Cancel a running task
    Cancel {
        /// Task id
        #[arg(value_name = "TASK_ID")]
        task_id: Uuid,
    },
}

pub async fn handle_command(command: TaskCommand, base_url: &str) -> Result<()> {
    let client = GatewayClient::new(base_url)?;

    match command {
        TaskCommand::Submit { task_file, wait } => {
            let raw = tokio::fs::read_to_string(&task_file)
                .await
                .with_context(|| format!("Failed to read {}", task_file.display()))?;
            let request: serde_json::Value =
                serde_yaml::from_str(&raw).context("Invalid task YAML")?;
            let task_id = client.submit_task(request).await?;
            println!("{} {}", "Submitted".green(), task_id);

            if wait {
                let status = wait_for_terminal(&client, task_id).await?;
                print_status(&status);
            }
            Ok(())
        }

        TaskCommand::Status { task_id } => {
            let status = client.task_status(task_id).await?;
            print_status(&status);
            Ok(())
        }

        TaskCommand::List => {
            let body = client.list_tasks().await?;
            let tasks = body["tasks"].as_array().cloned().unwrap_or_default();
            if tasks.is_empty() {
                println!("{}", "No tasks".yellow());
                return Ok(());
            }
            println!(
                "{:<38} {:<18} {}",
                "TASK".bold(),
                "STATE".bold(),
                "GOAL".bold()
            );
            for task in tasks {
                println!(
                    "{:<38} {:<18} {}",
                    task["task_id"].as_str().unwrap_or("?"),
                    colorize_state(task["state"].as_str().unwrap_or("?")),
                    task["goal"].as_str().unwrap_or("")
                );
            }
            Ok(())
        }

        TaskCommand::Cancel { task_id } => {
            client.cancel_task(task_id).await?;
            println!("{} {}", "Cancelled".yellow(), task_id);
            Ok(())
        }
    }
}

async fn wait_for_terminal(client: &GatewayClient, task_id: Uuid) -> Result<serde_json::Value> {
    loop {
        let status = client.task_status(task_id).await?;
        match status["state"].as_str() {
            Some("succeeded") | Some("partially_failed") | Some("failed") => return Ok(status),
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

fn print_status(status: &serde_json::Value) {
    println!(
        "{} {} ({})",
        "Task".bold(),
        status["task_id"].as_str().unwrap_or("?"),
        colorize_state(status["state"].as_str().unwrap_or("?"))
    );
    println!("Goal: {}", status["goal"].as_str().unwrap_or(""));
    if let Some(subtasks) = status["subtasks"].as_object() {
        let mut names: Vec<&String> = subtasks.keys().collect();
        names.sort();
        for name in names {
            println!(
                "  {:<24} {}",
                name,
                colorize_state(subtasks[name].as_str().unwrap_or("?"))
            );
        }
    }
    if let Some(results) = status["results"].as_object() {
        if !results.is_empty() {
            println!("Results:");
            for (name, result) in results {
                println!("  {}: {}", name, result);
            }
        }
    }
}

fn colorize_state(state: &str) -> colored::ColoredString {
    match state {
        "succeeded" => state.green(),
        "running" | "pending" | "dispatched" | "ready" | "retrying" => state.cyan(),
        "partially_failed" => state.yellow(),
        _ => state.red(),
    }
}
