// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Device Registry Service
//!
//! Owns the device table exclusively; every other component reads through
//! this service. Selection is pluggable; the default strategy is
//! least-loaded among capability-superset matches, ties broken by the
//! freshest heartbeat (best liveness evidence), then lexicographic id.
//!
//! `select` never blocks: it fails fast with `NoCapableDevice` and leaves
//! retry policy to the caller.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::config::HeartbeatConfig;
use crate::domain::device::{
    Capability, Device, DeviceError, DeviceId, DeviceStatus, DeviceType,
};
use crate::domain::events::FleetEvent;
use crate::infrastructure::event_bus::EventBus;

use super::health::{DeviceProbeSource, HealthProbe, HttpHealthProbe};

const DEVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pluggable device selection strategy
///
/// Candidates are pre-filtered to online devices satisfying the
/// capability requirement; the strategy only ranks them.
pub trait SelectionStrategy: Send + Sync {
    fn choose(&self, candidates: &[&Device]) -> Option<DeviceId>;
}

/// Default strategy: least loaded, freshest heartbeat, stable id order
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn choose(&self, candidates: &[&Device]) -> Option<DeviceId> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.load_score
                    .partial_cmp(&b.load_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.last_heartbeat.cmp(&a.last_heartbeat))
                    .then(a.id.cmp(&b.id))
            })
            .map(|d| d.id.clone())
    }
}

/// Registration request from a `register` message or the admin surface
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Registration {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: String,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
    strategy: Box<dyn SelectionStrategy>,
    heartbeat: HeartbeatConfig,
    event_bus: Arc<EventBus>,
}

impl DeviceRegistry {
    pub fn new(heartbeat: HeartbeatConfig, event_bus: Arc<EventBus>) -> Self {
        Self::with_strategy(heartbeat, event_bus, Box::new(LeastLoaded))
    }

    pub fn with_strategy(
        heartbeat: HeartbeatConfig,
        event_bus: Arc<EventBus>,
        strategy: Box<dyn SelectionStrategy>,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            strategy,
            heartbeat,
            event_bus,
        }
    }

    /// Register a device, or reset liveness on a re-registration.
    ///
    /// Re-registration is the only path out of `Offline`.
    pub async fn register(&self, registration: Registration) {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&registration.device_id) {
            Some(existing) => {
                info!(device_id = %registration.device_id, "Device re-registered");
                existing.reregister(registration.capabilities, registration.endpoint);
            }
            None => {
                info!(
                    device_id = %registration.device_id,
                    capabilities = ?registration.capabilities,
                    "Device registered"
                );
                devices.insert(
                    registration.device_id.clone(),
                    Device::new(
                        registration.device_id.clone(),
                        registration.device_type,
                        registration.capabilities,
                        registration.endpoint,
                    ),
                );
            }
        }
        self.event_bus.publish(FleetEvent::DeviceRegistered {
            device_id: registration.device_id,
            at: Utc::now(),
        });
    }

    /// Record a heartbeat; returns false for unknown devices (the caller
    /// should ask the device to re-register).
    pub async fn update_heartbeat(
        &self,
        device_id: &DeviceId,
        reported_load: Option<f64>,
    ) -> bool {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            debug!(device_id = %device_id, "Heartbeat from unregistered device");
            return false;
        };
        let before = device.status;
        device.record_heartbeat(Utc::now());
        if let Some(load) = reported_load {
            device.load_score = load.max(0.0);
            device.version_vector.bump("load_score");
        }
        if before != device.status {
            self.publish_status_change(device_id.clone(), before, device.status);
        }
        true
    }

    /// Select one device satisfying `required`, never blocking.
    pub async fn select(
        &self,
        required: &BTreeSet<Capability>,
    ) -> Result<Device, DeviceError> {
        self.select_excluding(required, &HashSet::new()).await
    }

    /// Select avoiding `excluded` device ids, so a retry can land
    /// somewhere other than the device that just failed.
    pub async fn select_excluding(
        &self,
        required: &BTreeSet<Capability>,
        excluded: &HashSet<DeviceId>,
    ) -> Result<Device, DeviceError> {
        let no_capable = || {
            DeviceError::NoCapableDevice(
                required.iter().map(|c| c.as_str().to_string()).collect(),
            )
        };

        let devices = self.devices.read().await;
        let candidates: Vec<&Device> = devices
            .values()
            .filter(|d| {
                d.status == DeviceStatus::Online
                    && d.satisfies(required)
                    && !excluded.contains(&d.id)
            })
            .collect();

        let chosen = self.strategy.choose(&candidates).ok_or_else(no_capable)?;

        // The strategy only ranks; an id outside the candidate set is a
        // misbehaving plugin, not a routable device.
        match candidates.iter().find(|c| c.id == chosen) {
            Some(device) => Ok((**device).clone()),
            None => {
                warn!(device_id = %chosen, "Selection strategy returned a non-candidate device");
                Err(no_capable())
            }
        }
    }

    pub async fn mark_offline(&self, device_id: &DeviceId) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(device_id) {
            let before = device.status;
            device.set_status(DeviceStatus::Offline);
            if before != DeviceStatus::Offline {
                warn!(device_id = %device_id, "Device marked offline");
                self.publish_status_change(device_id.clone(), before, DeviceStatus::Offline);
            }
        }
    }

    /// Administrative removal: the only way a device leaves the table.
    pub async fn deregister(&self, device_id: &DeviceId) -> Result<(), DeviceError> {
        let mut devices = self.devices.write().await;
        devices
            .remove(device_id)
            .ok_or_else(|| DeviceError::NotRegistered(device_id.clone()))?;
        info!(device_id = %device_id, "Device deregistered");
        self.event_bus.publish(FleetEvent::DeviceDeregistered {
            device_id: device_id.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Adjust a device's load score (task assignment/completion).
    pub async fn adjust_load(&self, device_id: &DeviceId, delta: f64) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(device_id) {
            device.adjust_load(delta);
        }
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn list(&self) -> Vec<Device> {
        let mut all: Vec<Device> = self.devices.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Fold a replica's device record into ours (per-field version vectors).
    pub async fn reconcile_replica(&self, remote: Device) {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&remote.id) {
            Some(local) => local.reconcile(&remote),
            None => {
                devices.insert(remote.id.clone(), remote);
            }
        }
    }

    /// One liveness sweep applying the heartbeat hysteresis:
    /// no heartbeat inside the degraded window flips online -> degraded;
    /// past the longer offline window, degraded -> offline (monotonic).
    pub async fn sweep(&self) {
        let now = Utc::now();
        let degraded_window = chrono::Duration::from_std(self.heartbeat.degraded_window())
            .unwrap_or(chrono::Duration::MAX);
        let offline_window = chrono::Duration::from_std(self.heartbeat.offline_window())
            .unwrap_or(chrono::Duration::MAX);

        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            let silence = now - device.last_heartbeat;
            let next = match device.status {
                DeviceStatus::Online if silence > degraded_window => DeviceStatus::Degraded,
                DeviceStatus::Degraded if silence > offline_window => DeviceStatus::Offline,
                current => current,
            };
            if next != device.status {
                let before = device.status;
                device.set_status(next);
                warn!(
                    device_id = %device.id,
                    from = ?before,
                    to = ?next,
                    silence_seconds = silence.num_seconds(),
                    "Liveness transition"
                );
                self.publish_status_change(device.id.clone(), before, next);
            }
        }
    }

    /// Spawn the periodic liveness sweep
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.heartbeat.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    /// Export the full table (snapshotting)
    pub async fn export(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Restore a previously snapshotted table
    pub async fn import(&self, snapshot: Vec<Device>) {
        let mut devices = self.devices.write().await;
        for device in snapshot {
            devices.entry(device.id.clone()).or_insert(device);
        }
    }

    fn publish_status_change(&self, device_id: DeviceId, from: DeviceStatus, to: DeviceStatus) {
        self.event_bus.publish(FleetEvent::DeviceStatusChanged {
            device_id,
            from,
            to,
            at: Utc::now(),
        });
    }
}

/// The health monitor follows the registry: every registered device is
/// probed at its `/health` endpoint under the `device:<id>` target name.
#[async_trait]
impl DeviceProbeSource for DeviceRegistry {
    async fn device_probes(&self) -> Vec<Arc<dyn HealthProbe>> {
        let devices = self.devices.read().await;
        devices
            .values()
            .map(|device| {
                Arc::new(HttpHealthProbe::new(
                    format!("device:{}", device.id),
                    format!("{}/health", device.endpoint.trim_end_matches('/')),
                    DEVICE_PROBE_TIMEOUT,
                )) as Arc<dyn HealthProbe>
            })
            .collect()
    }
}
