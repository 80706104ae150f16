// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) configuring
// every tunable of the fleet gateway. The retry, interval and TTL values
// the source system hard-coded per module are configuration defaults
// here; operators override them in the manifest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::task::RetryPolicy;

/// Top-level Kubernetes-style gateway configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Heartbeat sub-protocol tuning
///
/// Hysteresis: `degraded_after_misses` consecutive missed heartbeats flip
/// a device to degraded; `offline_after_misses` further misses flip it to
/// offline. Two thresholds avoid flapping on transient jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub interval: Duration,

    #[serde(default = "default_degraded_misses")]
    pub degraded_after_misses: u32,

    #[serde(default = "default_offline_misses")]
    pub offline_after_misses: u32,

    /// How often the liveness sweep re-evaluates device status
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl HeartbeatConfig {
    /// A device is online iff a heartbeat arrived inside this window
    pub fn degraded_window(&self) -> Duration {
        self.interval * self.degraded_after_misses
    }

    pub fn offline_window(&self) -> Duration {
        self.interval * (self.degraded_after_misses + self.offline_after_misses)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            degraded_after_misses: default_degraded_misses(),
            offline_after_misses: default_offline_misses(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Concurrent dispatch bound over the ready-set
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-dispatch round-trip budget
    #[serde(with = "humantime_serde", default = "default_dispatch_timeout")]
    pub dispatch_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
            retry: RetryPolicy::default(),
            dispatch_timeout: default_dispatch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "humantime_serde", default = "default_reap_interval")]
    pub reap_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_max_lock_age")]
    pub max_lock_age: Duration,

    /// Default advisory TTL handed to new locks
    #[serde(with = "humantime_serde", default = "default_lock_ttl")]
    pub default_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            reap_interval: default_reap_interval(),
            max_lock_age: default_max_lock_age(),
            default_ttl: default_lock_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Budget for establishing a direct peer-to-peer path before falling
    /// back to relayed transport.
    #[serde(with = "humantime_serde", default = "default_direct_path_timeout")]
    pub direct_path_timeout: Duration,

    #[serde(default = "default_max_resume_attempts")]
    pub max_resume_attempts: u32,

    /// Address reflector used for direct-path discovery; without one
    /// every transfer is relayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflector_url: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            direct_path_timeout: default_direct_path_timeout(),
            max_resume_attempts: default_max_resume_attempts(),
            reflector_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde", default = "default_probe_interval")]
    pub probe_interval: Duration,

    /// Consecutive failures before the restart hook fires
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Post-restart probe backoff ceiling
    #[serde(with = "humantime_serde", default = "default_probe_backoff_cap")]
    pub probe_backoff_cap: Duration,

    /// Maximum time a target may sit in recovering before escalation
    #[serde(with = "humantime_serde", default = "default_recovery_window")]
    pub recovery_window: Duration,

    /// Probed subsystems; each is restarted through the configured hook
    /// after repeated failures.
    #[serde(default)]
    pub targets: Vec<HealthTargetSpec>,
}

/// One monitored target: probed over HTTP, restarted by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTargetSpec {
    pub name: String,
    pub probe_url: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            failure_threshold: default_failure_threshold(),
            probe_backoff_cap: default_probe_backoff_cap(),
            recovery_window: default_recovery_window(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding registry/lock snapshots and the reap audit log
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(with = "humantime_serde", default = "default_snapshot_interval")]
    pub snapshot_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            snapshot_interval: default_snapshot_interval(),
        }
    }
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_degraded_misses() -> u32 {
    3
}

fn default_offline_misses() -> u32 {
    3
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_fan_out() -> usize {
    8
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_lock_age() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_chunk_size() -> u64 {
    64 * 1024
}

fn default_direct_path_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_max_resume_attempts() -> u32 {
    5
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_backoff_cap() -> Duration {
    Duration::from_secs(300)
}

fn default_recovery_window() -> Duration {
    Duration::from_secs(120)
}

fn default_state_dir() -> String {
    "/var/lib/aegis-fleet".to_string()
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(30)
}

pub const EXPECTED_API_VERSION: &str = "100monkeys.ai/v1";
pub const EXPECTED_KIND: &str = "GatewayConfig";

impl GatewayConfigManifest {
    /// Load and validate a manifest from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&raw)
    }

    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != EXPECTED_API_VERSION {
            return Err(ConfigError::InvalidApiVersion(self.api_version.clone()));
        }
        if self.kind != EXPECTED_KIND {
            return Err(ConfigError::InvalidKind(self.kind.clone()));
        }
        self.spec.validate()
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.degraded_after_misses == 0 || self.heartbeat.offline_after_misses == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat miss thresholds must be non-zero".to_string(),
            ));
        }
        if self.router.fan_out == 0 {
            return Err(ConfigError::InvalidValue(
                "router.fan_out must be non-zero".to_string(),
            ));
        }
        if self.router.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "router.retry.max_attempts must be non-zero".to_string(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "transfer.chunk_size must be non-zero".to_string(),
            ));
        }
        if self.lock.max_lock_age < self.lock.reap_interval {
            return Err(ConfigError::InvalidValue(
                "lock.max_lock_age must be at least lock.reap_interval".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "health.failure_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("Failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid API version: expected '100monkeys.ai/v1', got '{0}'")]
    InvalidApiVersion(String),

    #[error("Invalid kind: expected 'GatewayConfig', got '{0}'")]
    InvalidKind(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        GatewayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_manifest_parse_and_overrides() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: GatewayConfig
metadata:
  name: fleet-dev
spec:
  heartbeat:
    interval: 2s
  lock:
    reap_interval: 10s
    max_lock_age: 30s
  transfer:
    chunk_size: 1024
"#;
        let manifest = GatewayConfigManifest::parse(yaml).unwrap();
        assert_eq!(manifest.spec.heartbeat.interval, Duration::from_secs(2));
        assert_eq!(manifest.spec.lock.max_lock_age, Duration::from_secs(30));
        assert_eq!(manifest.spec.transfer.chunk_size, 1024);
        // Untouched sections fall back to defaults
        assert_eq!(manifest.spec.router.fan_out, 8);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: NodeConfig
metadata:
  name: x
spec: {}
"#;
        assert!(matches!(
            GatewayConfigManifest::parse(yaml),
            Err(ConfigError::InvalidKind(_))
        ));
    }

    #[test]
    fn test_hysteresis_windows() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.degraded_window(), Duration::from_secs(30));
        assert_eq!(hb.offline_window(), Duration::from_secs(60));
    }
}
