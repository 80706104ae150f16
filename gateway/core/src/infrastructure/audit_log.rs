// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reaper Audit Log
//!
//! Append-only JSONL record of every forced lock removal, so a stuck task
//! can always be traced back to a reaped lock after the fact. Records are
//! never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub resource_id: String,
    pub holder_id: String,
    pub age_seconds: u64,
    pub reason: AuditReason,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    /// Age exceeded `max_lock_age`; holder assumed crashed or partitioned
    StaleReap,
    /// Operator removed the lock via the admin surface
    ForceRelease,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditLogError {
    #[error("Audit log I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt audit record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Append-only audit log backed by a JSONL file
pub struct AuditLog {
    path: PathBuf,
    writer: tokio::sync::Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; each call writes a single line and flushes.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditLogError> {
        let _guard = self.writer.lock().await;

        let mut line = serde_json::to_vec(record).map_err(|source| AuditLogError::Corrupt {
            line: 0,
            source,
        })?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        file.write_all(&line)
            .await
            .map_err(|source| self.io_error(source))?;
        file.flush().await.map_err(|source| self.io_error(source))?;
        Ok(())
    }

    /// Read the full history (admin/debug use)
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, AuditLogError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|source| AuditLogError::Corrupt {
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn io_error(&self, source: std::io::Error) -> AuditLogError {
        AuditLogError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(resource: &str) -> AuditRecord {
        AuditRecord {
            resource_id: resource.to_string(),
            holder_id: "holder-a".to_string(),
            age_seconds: 400,
            reason: AuditReason::StaleReap,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("reaps.jsonl"));

        log.append(&record("resource-1")).await.unwrap();
        log.append(&record("resource-2")).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].resource_id, "resource-1");
        assert_eq!(records[1].resource_id, "resource-2");
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("nothing.jsonl"));
        assert!(log.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_lines_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reaps.jsonl");
        let log = AuditLog::new(&path);

        log.append(&record("resource-1")).await.unwrap();
        let first = tokio::fs::read_to_string(&path).await.unwrap();

        log.append(&record("resource-2")).await.unwrap();
        let both = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(both.starts_with(&first));
    }
}
