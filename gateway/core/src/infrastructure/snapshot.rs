// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! State Snapshotting
//!
//! Periodic JSON snapshots of the device registry and lock table so both
//! survive gateway restarts. Writes are atomic (temp file + rename); a
//! half-written snapshot can never shadow the previous good one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::device::Device;
use crate::domain::lock::Lock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub devices: Vec<Device>,
    pub locks: Vec<Lock>,
    pub saved_at: DateTime<Utc>,
}

impl GatewaySnapshot {
    pub fn new(devices: Vec<Device>, locks: Vec<Lock>) -> Self {
        Self {
            devices,
            locks,
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// File-backed snapshot store
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot atomically
    pub async fn save(&self, snapshot: &GatewaySnapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        info!(
            devices = snapshot.devices.len(),
            locks = snapshot.locks.len(),
            path = %self.path.display(),
            "Snapshot persisted"
        );
        Ok(())
    }

    /// Load the latest snapshot, or `None` when none exists yet
    pub async fn load(&self) -> Result<Option<GatewaySnapshot>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
