// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Device Domain Model
//!
//! A device is any fleet participant exposing a fixed capability set:
//! desktop agents, mobile agents, IoT nodes or simulated devices. Identity
//! (`DeviceId`) is stable across reconnects; the record is removed only by
//! explicit administrative deregistration, never by liveness decay.
//!
//! # Invariants
//!
//! - `status == Online` iff a heartbeat arrived within the configured
//!   timeout window; the transition to `Offline` is monotonic until a fresh
//!   `register` message resets it.
//! - Concurrent updates from multiple gateway replicas reconcile per field
//!   through the version vector; ties break on wall clock, then on
//!   lexicographic device id, so every replica converges to the same value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Stable device identifier (survives reconnects)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Well-known identity of the orchestrating gateway itself
    pub fn gateway() -> Self {
        Self("gateway".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named action a device can perform (e.g. "ocr", "ssh-exec")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Iot,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Degraded,
    Offline,
}

/// Per-field logical clock used to reconcile concurrent replica updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: HashMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> u64 {
        self.counters.get(field).copied().unwrap_or(0)
    }

    /// Bump the clock for `field` after a local mutation
    pub fn bump(&mut self, field: &str) {
        *self.counters.entry(field.to_string()).or_insert(0) += 1;
    }

    /// Take the component-wise maximum of two vectors
    pub fn merge(&mut self, other: &VersionVector) {
        for (field, counter) in &other.counters {
            let entry = self.counters.entry(field.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }
}

/// Outcome of reconciling one field between two replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWinner {
    Local,
    Remote,
}

/// Fields reconciled individually between gateway replicas
pub const VERSIONED_FIELDS: &[&str] = &["capabilities", "status", "endpoint", "load_score"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub capabilities: BTreeSet<Capability>,
    pub status: DeviceStatus,
    /// Address/transport hint for dispatch (HTTP base URL for agents)
    pub endpoint: String,
    pub last_heartbeat: DateTime<Utc>,
    /// Updated on task assignment and completion
    pub load_score: f64,
    pub version_vector: VersionVector,
    pub registered_at: DateTime<Utc>,
    /// Wall clock of the last mutation, used as a merge tie-break
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: DeviceId,
        device_type: DeviceType,
        capabilities: BTreeSet<Capability>,
        endpoint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            device_type,
            capabilities,
            status: DeviceStatus::Online,
            endpoint: endpoint.into(),
            last_heartbeat: now,
            load_score: 0.0,
            version_vector: VersionVector::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    /// Whether this device can serve every capability in `required`
    pub fn satisfies(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Record a fresh heartbeat; offline devices stay offline until a new
    /// `register` message resets them (monotonic offline transition).
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat = at;
        if self.status != DeviceStatus::Offline {
            self.status = DeviceStatus::Online;
            self.version_vector.bump("status");
        }
        self.updated_at = Utc::now();
    }

    /// Re-registration resets liveness and replaces the capability set
    pub fn reregister(&mut self, capabilities: BTreeSet<Capability>, endpoint: String) {
        let now = Utc::now();
        if capabilities != self.capabilities {
            self.capabilities = capabilities;
            self.version_vector.bump("capabilities");
        }
        if endpoint != self.endpoint {
            self.endpoint = endpoint;
            self.version_vector.bump("endpoint");
        }
        self.status = DeviceStatus::Online;
        self.version_vector.bump("status");
        self.last_heartbeat = now;
        self.updated_at = now;
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        if self.status != status {
            self.status = status;
            self.version_vector.bump("status");
            self.updated_at = Utc::now();
        }
    }

    pub fn adjust_load(&mut self, delta: f64) {
        self.load_score = (self.load_score + delta).max(0.0);
        self.version_vector.bump("load_score");
        self.updated_at = Utc::now();
    }

    /// Decide which replica wins a contested field
    ///
    /// Higher vector component wins; ties break by wall-clock `updated_at`,
    /// then by lexicographic device id (deterministic everywhere).
    pub fn field_winner(&self, other: &Device, field: &str) -> FieldWinner {
        let local = self.version_vector.get(field);
        let remote = other.version_vector.get(field);
        if local != remote {
            return if local > remote {
                FieldWinner::Local
            } else {
                FieldWinner::Remote
            };
        }
        if self.updated_at != other.updated_at {
            return if self.updated_at > other.updated_at {
                FieldWinner::Local
            } else {
                FieldWinner::Remote
            };
        }
        // Same id on both replicas makes this a stable no-op preference
        if self.id <= other.id {
            FieldWinner::Local
        } else {
            FieldWinner::Remote
        }
    }

    /// Fold a remote replica's view of this device into the local record
    pub fn reconcile(&mut self, remote: &Device) {
        debug_assert_eq!(self.id, remote.id);

        for field in VERSIONED_FIELDS {
            if self.field_winner(remote, field) == FieldWinner::Remote {
                match *field {
                    "capabilities" => self.capabilities = remote.capabilities.clone(),
                    "status" => self.status = remote.status,
                    "endpoint" => self.endpoint = remote.endpoint.clone(),
                    "load_score" => self.load_score = remote.load_score,
                    _ => {}
                }
            }
        }
        // Heartbeats are monotonic evidence, not a contested field
        if remote.last_heartbeat > self.last_heartbeat {
            self.last_heartbeat = remote.last_heartbeat;
        }
        self.version_vector.merge(&remote.version_vector);
        self.updated_at = self.updated_at.max(remote.updated_at);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No online device satisfies capabilities: {0:?}")]
    NoCapableDevice(Vec<String>),

    #[error("Device '{0}' is not registered")]
    NotRegistered(DeviceId),

    #[error("Device '{0}' is already registered")]
    AlreadyRegistered(DeviceId),
}
