// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end flows across the assembled gateway services: registration
//! and routing, load-aware selection, interrupted transfers, and the lock
//! reap cycle, using an in-process transport in place of real devices.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use aegis_fleet_core::application::health::{HealthMonitor, HealthProbe, RestartHook};
use aegis_fleet_core::application::lock_manager::LockManager;
use aegis_fleet_core::application::registry::{DeviceRegistry, Registration};
use aegis_fleet_core::application::router::TaskRouter;
use aegis_fleet_core::application::transfer_manager::{
    PathDiscovery, TransferManager,
};
use aegis_fleet_core::domain::config::{
    HeartbeatConfig, HealthConfig, LockConfig, RouterConfig, TransferConfig,
};
use aegis_fleet_core::domain::device::{Capability, Device, DeviceId, DeviceType};
use aegis_fleet_core::domain::message::Envelope;
use aegis_fleet_core::domain::provider::ProviderRegistry;
use aegis_fleet_core::domain::task::{RetryPolicy, Subtask, SubtaskId, TaskState};
use aegis_fleet_core::domain::transfer::{digest_hex, PayloadDescriptor, TransferState};
use aegis_fleet_core::infrastructure::audit_log::{AuditLog, AuditReason};
use aegis_fleet_core::infrastructure::event_bus::EventBus;
use aegis_fleet_core::infrastructure::transport::{DeviceTransport, TransportError};

/// Transport that "executes" every command locally and remembers which
/// device each dispatch landed on.
struct RecordingTransport {
    dispatched: std::sync::Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatched: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn devices_hit(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    async fn send(
        &self,
        device: &Device,
        envelope: &Envelope,
    ) -> Result<Envelope, TransportError> {
        self.dispatched.lock().unwrap().push(device.id.to_string());
        Ok(Envelope::result_for(
            envelope,
            serde_json::json!({ "device": device.id.to_string(), "ok": true }),
        ))
    }
}

struct NoDirectPath;

#[async_trait]
impl PathDiscovery for NoDirectPath {
    async fn probe_direct(&self, _s: &DeviceId, _t: &DeviceId) -> bool {
        false
    }
}

fn heartbeat_config() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_secs(10),
        degraded_after_misses: 3,
        offline_after_misses: 3,
        sweep_interval: Duration::from_secs(5),
    }
}

fn router_config() -> RouterConfig {
    RouterConfig {
        fan_out: 8,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(4),
        },
        dispatch_timeout: Duration::from_secs(5),
    }
}

fn registration(id: &str, caps: &[&str], load_hint: &str) -> Registration {
    Registration {
        device_id: DeviceId::new(id),
        device_type: DeviceType::Iot,
        capabilities: caps.iter().map(|c| Capability::new(*c)).collect(),
        endpoint: format!("http://{}:9000", load_hint),
    }
}

fn sid(s: &str) -> SubtaskId {
    SubtaskId::new(s).unwrap()
}

async fn wait_terminal(router: &TaskRouter, task_id: aegis_fleet_core::domain::task::TaskId) {
    for _ in 0..200 {
        if let Some(status) = router.status(&task_id).await {
            if status.state.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task never became terminal");
}

#[tokio::test]
async fn test_register_then_route_by_capability() {
    let event_bus = Arc::new(EventBus::with_default_capacity());
    let registry = Arc::new(DeviceRegistry::new(heartbeat_config(), Arc::clone(&event_bus)));
    let transport = RecordingTransport::new();
    let router = Arc::new(TaskRouter::new(
        Arc::clone(&registry),
        transport.clone(),
        Arc::new(ProviderRegistry::new()),
        router_config(),
        Arc::clone(&event_bus),
    ));

    registry.register(registration("device-a", &["ocr"], "10.0.0.1")).await;
    registry
        .register(registration("device-b", &["ssh-exec"], "10.0.0.2"))
        .await;

    let subtask = Subtask::new(sid("read-label"), Capability::new("ocr"), "ocr_extract")
        .with_params(serde_json::json!({ "image": "label.png" }));
    let task_id = router.submit("digitize label", vec![subtask]).await.unwrap();
    wait_terminal(&router, task_id).await;

    let status = router.status(&task_id).await.unwrap();
    assert_eq!(status.state, TaskState::Succeeded);
    assert_eq!(status.results[&sid("read-label")]["device"], "device-a");
    assert_eq!(transport.devices_hit(), vec!["device-a"]);
}

#[tokio::test]
async fn test_least_loaded_device_preferred() {
    let event_bus = Arc::new(EventBus::with_default_capacity());
    let registry = Arc::new(DeviceRegistry::new(heartbeat_config(), Arc::clone(&event_bus)));
    let transport = RecordingTransport::new();
    let router = Arc::new(TaskRouter::new(
        Arc::clone(&registry),
        transport.clone(),
        Arc::new(ProviderRegistry::new()),
        router_config(),
        Arc::clone(&event_bus),
    ));

    registry.register(registration("busy", &["ocr"], "10.0.0.1")).await;
    registry.register(registration("idle", &["ocr"], "10.0.0.2")).await;
    registry.adjust_load(&DeviceId::new("busy"), 4.0).await;

    let subtask = Subtask::new(sid("scan"), Capability::new("ocr"), "run");
    let task_id = router.submit("prefer idle", vec![subtask]).await.unwrap();
    wait_terminal(&router, task_id).await;

    assert_eq!(transport.devices_hit(), vec!["idle"]);
}

#[tokio::test]
async fn test_transfer_drop_and_resume_round_trip() {
    let manager = TransferManager::new(
        TransferConfig {
            chunk_size: 10,
            direct_path_timeout: Duration::from_millis(20),
            max_resume_attempts: 5,
            reflector_url: None,
        },
        Arc::new(NoDirectPath),
        Arc::new(EventBus::with_default_capacity()),
    );

    let data: Vec<u8> = (0..100u32).map(|i| (i % 251) as u8).collect();
    let id = manager
        .open(
            PayloadDescriptor {
                name: "firmware.bin".to_string(),
                total_size: 100,
                checksum: digest_hex(&data),
            },
            &DeviceId::new("sender"),
            &DeviceId::new("receiver"),
        )
        .await
        .unwrap();

    // First four chunks land, then the link dies
    for i in 0..4 {
        let chunk = Bytes::copy_from_slice(&data[i * 10..(i + 1) * 10]);
        let sum = digest_hex(&chunk);
        manager.submit_chunk(id, i, chunk, &sum).await.unwrap();
    }
    assert_eq!(manager.resume(id).await.unwrap(), 40);

    // Sender resumes from offset 40 instead of restarting
    for i in 4..10 {
        let chunk = Bytes::copy_from_slice(&data[i * 10..(i + 1) * 10]);
        let sum = digest_hex(&chunk);
        manager.submit_chunk(id, i, chunk, &sum).await.unwrap();
    }
    let payload = manager.complete(id).await.unwrap();
    assert_eq!(&payload[..], &data[..]);
    assert_eq!(manager.status(&id).await.unwrap().state, TransferState::Complete);
}

#[tokio::test]
async fn test_lock_reap_unblocks_next_holder() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("reaps.jsonl");
    let manager = LockManager::new(
        LockConfig {
            reap_interval: Duration::from_secs(60),
            max_lock_age: Duration::from_secs(300),
            default_ttl: Duration::from_secs(120),
        },
        Arc::new(AuditLog::new(audit_path.clone())),
        Arc::new(EventBus::with_default_capacity()),
    );

    // Holder dies without releasing
    manager.acquire("gpio-bus", "crashed-agent").await.unwrap();
    assert!(manager.acquire("gpio-bus", "next-agent").await.is_err());

    // The reaper clears it once it exceeds the age limit
    let later = Utc::now() + ChronoDuration::seconds(301);
    assert_eq!(manager.reap_once(later).await, 1);
    manager.acquire("gpio-bus", "next-agent").await.unwrap();

    let audit = AuditLog::new(audit_path);
    let records = audit.read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, AuditReason::StaleReap);
    assert_eq!(records[0].holder_id, "crashed-agent");
}

#[tokio::test]
async fn test_failed_subsystem_restarted_once_then_recovers() {
    struct ScriptedProbe {
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        fn target(&self) -> &str {
            "relay"
        }

        async fn probe(&self) -> Result<(), String> {
            if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err("down".to_string())
            }
        }
    }

    struct RevivingHook {
        probe: Arc<ScriptedProbe>,
        restarts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RestartHook for RevivingHook {
        async fn restart(&self, _target: &str) -> anyhow::Result<()> {
            // The restart actually fixes the target
            self.probe
                .healthy
                .store(true, std::sync::atomic::Ordering::SeqCst);
            self.restarts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    let probe = Arc::new(ScriptedProbe {
        healthy: std::sync::atomic::AtomicBool::new(false),
    });
    let hook = Arc::new(RevivingHook {
        probe: Arc::clone(&probe),
        restarts: std::sync::atomic::AtomicUsize::new(0),
    });
    let monitor = HealthMonitor::new(
        HealthConfig {
            probe_interval: Duration::from_secs(10),
            failure_threshold: 3,
            probe_backoff_cap: Duration::from_secs(60),
            recovery_window: Duration::from_secs(120),
            targets: Vec::new(),
        },
        Arc::clone(&hook) as Arc<dyn RestartHook>,
        Arc::new(EventBus::with_default_capacity()),
    );
    monitor.register_target(Arc::clone(&probe) as Arc<dyn HealthProbe>).await;

    let mut now = Utc::now();
    for _ in 0..4 {
        monitor.tick(now).await;
        now += ChronoDuration::seconds(11);
    }

    let reports = monitor.status().await;
    assert_eq!(hook.restarts.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(reports[0].restarts, 1);
    assert_eq!(
        reports[0].phase,
        aegis_fleet_core::application::health::TargetPhase::Healthy
    );
}
