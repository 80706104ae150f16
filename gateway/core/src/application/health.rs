// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health Monitor & Self-Healer
//!
//! Probes registered targets on a fixed cadence and restarts the ones
//! that fail three consecutive probes. Restarted targets are probed with
//! exponentially backed-off intervals until they answer again; a target
//! that stays down past the recovery window is escalated to degraded and
//! left for an operator (manual probes still work and can bring it back).
//!
//! Targets come from two places: collaborators registered explicitly at
//! boot, and the device fleet via a `DeviceProbeSource`, re-synced on
//! every pass so probing follows registration and deregistration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::config::HealthConfig;
use crate::domain::events::FleetEvent;
use crate::domain::provider::{CapabilityProvider, HealthState};
use crate::infrastructure::event_bus::EventBus;

/// One probeable target (a subsystem, sidecar or downstream dependency)
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn target(&self) -> &str;
    /// A probe either answers healthy or it doesn't; the detail string is
    /// for the log only.
    async fn probe(&self) -> Result<(), String>;
}

/// Supervisor seam: how a failed target actually gets restarted
#[async_trait]
pub trait RestartHook: Send + Sync {
    async fn restart(&self, target: &str) -> anyhow::Result<()>;
}

/// Supplies probes for peers that come and go at runtime (the device
/// fleet); the monitor re-syncs its target table against this on every
/// pass.
#[async_trait]
pub trait DeviceProbeSource: Send + Sync {
    async fn device_probes(&self) -> Vec<Arc<dyn HealthProbe>>;
}

/// Probe over HTTP: healthy iff the endpoint answers 2xx in time
pub struct HttpHealthProbe {
    target: String,
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(target: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

/// Bridges a gateway-hosted capability provider's `health()` into the
/// monitor's probe cycle.
pub struct ProviderHealthProbe {
    target: String,
    provider: Arc<dyn CapabilityProvider>,
}

impl ProviderHealthProbe {
    pub fn new(target: impl Into<String>, provider: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            target: target.into(),
            provider,
        }
    }
}

#[async_trait]
impl HealthProbe for ProviderHealthProbe {
    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self) -> Result<(), String> {
        let report = self.provider.health().await;
        match report.status {
            HealthState::Healthy => Ok(()),
            HealthState::Unhealthy => {
                Err(report.detail.unwrap_or_else(|| "unhealthy".to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPhase {
    Healthy,
    Failing,
    Recovering,
    /// Escalated; automatic probing has given up on this target
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub phase: TargetPhase,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
}

struct TargetState {
    probe: Arc<dyn HealthProbe>,
    phase: TargetPhase,
    consecutive_failures: u32,
    restarts: u32,
    recovery_probes: u32,
    recovering_since: Option<DateTime<Utc>>,
    last_probe_at: Option<DateTime<Utc>>,
    next_due: DateTime<Utc>,
    /// Owned by the device source; dropped when the device deregisters
    fleet: bool,
}

pub struct HealthMonitor {
    targets: RwLock<HashMap<String, TargetState>>,
    config: HealthConfig,
    hook: Arc<dyn RestartHook>,
    event_bus: Arc<EventBus>,
    device_source: Option<Arc<dyn DeviceProbeSource>>,
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Unknown health target '{0}'")]
    UnknownTarget(String),
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, hook: Arc<dyn RestartHook>, event_bus: Arc<EventBus>) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            config,
            hook,
            event_bus,
            device_source: None,
        }
    }

    /// Attach the device fleet as a probe source; its targets track
    /// registration and deregistration.
    pub fn with_device_source(mut self, source: Arc<dyn DeviceProbeSource>) -> Self {
        self.device_source = Some(source);
        self
    }

    pub async fn register_target(&self, probe: Arc<dyn HealthProbe>) {
        let target = probe.target().to_string();
        info!(target = %target, "Health target registered");
        self.targets
            .write()
            .await
            .insert(target, fresh_state(probe, Utc::now(), false));
    }

    /// One monitor pass: sync fleet targets, then probe every target that
    /// is due. Degraded targets are skipped; only a manual probe touches
    /// them again.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.sync_fleet_targets(now).await;
        let due: Vec<String> = {
            let targets = self.targets.read().await;
            targets
                .values()
                .filter(|t| t.phase != TargetPhase::Degraded && t.next_due <= now)
                .map(|t| t.probe.target().to_string())
                .collect()
        };
        for target in due {
            self.probe_target(&target, now, false).await;
        }
    }

    /// Mirror the device source into the target table: new devices get a
    /// fresh probe state, deregistered ones are dropped. Explicitly
    /// registered collaborators are never touched.
    async fn sync_fleet_targets(&self, now: DateTime<Utc>) {
        let Some(source) = &self.device_source else {
            return;
        };
        let probes = source.device_probes().await;
        let live: HashSet<String> = probes.iter().map(|p| p.target().to_string()).collect();

        let mut targets = self.targets.write().await;
        targets.retain(|name, state| !state.fleet || live.contains(name));
        for probe in probes {
            let name = probe.target().to_string();
            targets
                .entry(name)
                .or_insert_with(|| fresh_state(probe, now, true));
        }
    }

    /// Operator-initiated probe: ignores the backoff schedule and the
    /// degraded gate, so it is also the recovery path for an escalated
    /// target.
    pub async fn probe_now(&self, target: &str) -> Result<TargetReport, HealthError> {
        self.probe_target(target, Utc::now(), true)
            .await
            .ok_or_else(|| HealthError::UnknownTarget(target.to_string()))?;
        let targets = self.targets.read().await;
        targets
            .get(target)
            .map(report_of)
            .ok_or_else(|| HealthError::UnknownTarget(target.to_string()))
    }

    pub async fn status(&self) -> Vec<TargetReport> {
        let targets = self.targets.read().await;
        let mut all: Vec<TargetReport> = targets.values().map(report_of).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = monitor.config.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.tick(Utc::now()).await;
            }
        })
    }

    async fn probe_target(&self, target: &str, now: DateTime<Utc>, manual: bool) -> Option<()> {
        let probe = {
            let targets = self.targets.read().await;
            Arc::clone(&targets.get(target)?.probe)
        };

        // Probe outside the lock; a hung probe must not freeze status
        // reporting for the rest of the fleet.
        let outcome = probe.probe().await;

        let restart_needed = {
            let mut targets = self.targets.write().await;
            let state = targets.get_mut(target)?;
            state.last_probe_at = Some(now);
            match outcome {
                Ok(()) => {
                    if state.phase != TargetPhase::Healthy {
                        info!(target = %target, from = ?state.phase, "Target recovered");
                    }
                    state.phase = TargetPhase::Healthy;
                    state.consecutive_failures = 0;
                    state.recovery_probes = 0;
                    state.recovering_since = None;
                    state.next_due = now + probe_interval(self.config.probe_interval);
                    false
                }
                Err(detail) => self.on_probe_failure(state, target, now, manual, &detail),
            }
        };

        if restart_needed {
            warn!(target = %target, "Failure threshold reached, restarting");
            self.event_bus.publish(FleetEvent::RestartTriggered {
                target: target.to_string(),
                at: Utc::now(),
            });
            if let Err(e) = self.hook.restart(target).await {
                error!(target = %target, error = %e, "Restart hook failed");
            }
        }
        Some(())
    }

    /// Apply one failed probe to the state machine; returns whether the
    /// restart hook should fire.
    fn on_probe_failure(
        &self,
        state: &mut TargetState,
        target: &str,
        now: DateTime<Utc>,
        manual: bool,
        detail: &str,
    ) -> bool {
        debug!(target = %target, detail = %detail, phase = ?state.phase, "Probe failed");
        match state.phase {
            TargetPhase::Degraded => {
                // Manual probe on an escalated target that is still down:
                // nothing changes.
                false
            }
            TargetPhase::Recovering => {
                state.recovery_probes += 1;
                let down_for = state
                    .recovering_since
                    .map(|since| now - since)
                    .unwrap_or_else(chrono::Duration::zero);
                let window = chrono::Duration::from_std(self.config.recovery_window)
                    .unwrap_or(chrono::Duration::MAX);
                if down_for > window && !manual {
                    warn!(
                        target = %target,
                        down_seconds = down_for.num_seconds(),
                        "Recovery window exceeded, escalating"
                    );
                    state.phase = TargetPhase::Degraded;
                    self.event_bus.publish(FleetEvent::TargetEscalated {
                        target: target.to_string(),
                        at: Utc::now(),
                    });
                } else {
                    // Exponential backoff between recovery probes
                    let backoff = self
                        .config
                        .probe_interval
                        .saturating_mul(2u32.saturating_pow(state.recovery_probes.min(20)))
                        .min(self.config.probe_backoff_cap);
                    state.next_due = now + probe_interval(backoff);
                }
                false
            }
            TargetPhase::Healthy | TargetPhase::Failing => {
                state.phase = TargetPhase::Failing;
                state.consecutive_failures += 1;
                self.event_bus.publish(FleetEvent::ProbeFailed {
                    target: target.to_string(),
                    consecutive_failures: state.consecutive_failures,
                    at: Utc::now(),
                });
                state.next_due = now + probe_interval(self.config.probe_interval);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.phase = TargetPhase::Recovering;
                    state.recovering_since = Some(now);
                    state.recovery_probes = 0;
                    state.consecutive_failures = 0;
                    state.restarts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }
}

fn probe_interval(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn fresh_state(probe: Arc<dyn HealthProbe>, now: DateTime<Utc>, fleet: bool) -> TargetState {
    TargetState {
        probe,
        phase: TargetPhase::Healthy,
        consecutive_failures: 0,
        restarts: 0,
        recovery_probes: 0,
        recovering_since: None,
        last_probe_at: None,
        next_due: now,
        fleet,
    }
}

fn report_of(state: &TargetState) -> TargetReport {
    TargetReport {
        target: state.probe.target().to_string(),
        phase: state.phase,
        consecutive_failures: state.consecutive_failures,
        restarts: state.restarts,
        last_probe_at: state.last_probe_at,
    }
}
