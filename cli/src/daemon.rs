// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Gateway daemon: wires the core services together and serves the HTTP
//! surface until SIGINT/SIGTERM. Registry and lock state is restored from
//! the last snapshot at boot and persisted on a timer and at shutdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use aegis_fleet_core::application::health::{
    DeviceProbeSource, HealthMonitor, HttpHealthProbe, ProviderHealthProbe, RestartHook,
};
use aegis_fleet_core::application::lock_manager::LockManager;
use aegis_fleet_core::application::registry::DeviceRegistry;
use aegis_fleet_core::application::router::TaskRouter;
use aegis_fleet_core::application::transfer_manager::{
    PathDiscovery, ReflectorDiscovery, RelayOnlyDiscovery, TransferManager,
};
use aegis_fleet_core::domain::config::{GatewayConfig, GatewayConfigManifest};
use aegis_fleet_core::domain::provider::ProviderRegistry;
use aegis_fleet_core::infrastructure::audit_log::AuditLog;
use aegis_fleet_core::infrastructure::event_bus::EventBus;
use aegis_fleet_core::infrastructure::snapshot::{GatewaySnapshot, SnapshotStore};
use aegis_fleet_core::infrastructure::transport::HttpDeviceTransport;
use aegis_fleet_core::presentation::http::{build_router, AppState};

pub async fn start_daemon(config_path: Option<PathBuf>, host: &str, port: u16) -> Result<()> {
    let config = Arc::new(load_config(config_path).await?);

    let event_bus = Arc::new(EventBus::with_default_capacity());
    let state_dir = PathBuf::from(&config.persistence.state_dir);
    let audit = Arc::new(AuditLog::new(state_dir.join("reaps.jsonl")));
    let snapshots = Arc::new(SnapshotStore::new(state_dir.join("state.json")));

    let registry = Arc::new(DeviceRegistry::new(
        config.heartbeat.clone(),
        Arc::clone(&event_bus),
    ));
    let locks = Arc::new(LockManager::new(
        config.lock.clone(),
        Arc::clone(&audit),
        Arc::clone(&event_bus),
    ));

    // Restore the last persisted state before anything can mutate it
    match snapshots.load().await {
        Ok(Some(snapshot)) => {
            info!(
                devices = snapshot.devices.len(),
                locks = snapshot.locks.len(),
                "Restoring snapshot"
            );
            registry.import(snapshot.devices).await;
            locks.import(snapshot.locks).await;
        }
        Ok(None) => info!("No snapshot found, starting fresh"),
        Err(e) => warn!(error = %e, "Snapshot restore failed, starting fresh"),
    }

    let transport = Arc::new(
        HttpDeviceTransport::new(config.router.dispatch_timeout)
            .context("Failed to build device transport")?,
    );
    // Gateway-hosted capabilities resolve here at boot; deployments add
    // their providers before the router is built.
    let providers = Arc::new(ProviderRegistry::new());
    let router = Arc::new(TaskRouter::new(
        Arc::clone(&registry),
        transport,
        Arc::clone(&providers),
        config.router.clone(),
        Arc::clone(&event_bus),
    ));

    let discovery: Arc<dyn PathDiscovery> = match &config.transfer.reflector_url {
        Some(url) => Arc::new(ReflectorDiscovery::new(url.clone())),
        None => Arc::new(RelayOnlyDiscovery),
    };
    let transfers = Arc::new(TransferManager::new(
        config.transfer.clone(),
        discovery,
        Arc::clone(&event_bus),
    ));

    let health = Arc::new(
        HealthMonitor::new(
            config.health.clone(),
            Arc::new(SystemctlRestartHook),
            Arc::clone(&event_bus),
        )
        .with_device_source(Arc::clone(&registry) as Arc<dyn DeviceProbeSource>),
    );
    for target in &config.health.targets {
        health
            .register_target(Arc::new(HttpHealthProbe::new(
                target.name.clone(),
                target.probe_url.clone(),
                Duration::from_secs(10),
            )))
            .await;
    }
    for capability in providers.capabilities() {
        if let Some(provider) = providers.resolve(&capability) {
            health
                .register_target(Arc::new(ProviderHealthProbe::new(
                    format!("provider:{}", capability),
                    provider,
                )))
                .await;
        }
    }

    // Background loops
    let sweeper = registry.spawn_sweeper();
    let reaper = locks.spawn_reaper();
    let monitor = health.spawn();
    let snapshotter = spawn_snapshot_loop(
        Arc::clone(&registry),
        Arc::clone(&locks),
        Arc::clone(&snapshots),
        config.persistence.snapshot_interval,
    );

    let app = build_router(AppState {
        registry: Arc::clone(&registry),
        router,
        locks: Arc::clone(&locks),
        transfers,
        health,
        event_bus,
        config: Arc::clone(&config),
        started_at: std::time::Instant::now(),
    });

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Fleet gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Gateway shutting down");
    sweeper.abort();
    reaper.abort();
    monitor.abort();
    snapshotter.abort();

    // Final snapshot so a clean shutdown never loses state
    let snapshot = GatewaySnapshot::new(registry.export().await, locks.export().await);
    if let Err(e) = snapshots.save(&snapshot).await {
        error!(error = %e, "Final snapshot failed");
    }
    Ok(())
}

async fn load_config(config_path: Option<PathBuf>) -> Result<GatewayConfig> {
    match config_path {
        Some(path) => {
            let manifest = GatewayConfigManifest::load(&path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?;
            info!(name = %manifest.metadata.name, "Configuration loaded");
            Ok(manifest.spec)
        }
        None => {
            info!("No configuration file given, using defaults");
            let config = GatewayConfig::default();
            config.validate().context("Invalid default configuration")?;
            Ok(config)
        }
    }
}

fn spawn_snapshot_loop(
    registry: Arc<DeviceRegistry>,
    locks: Arc<LockManager>,
    store: Arc<SnapshotStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so boot doesn't write an
        // empty snapshot over a restore in progress.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = GatewaySnapshot::new(registry.export().await, locks.export().await);
            if let Err(e) = store.save(&snapshot).await {
                error!(error = %e, "Periodic snapshot failed");
            }
        }
    })
}

/// Restart hook shelling out to systemd; targets map to unit names.
struct SystemctlRestartHook;

#[async_trait]
impl RestartHook for SystemctlRestartHook {
    async fn restart(&self, target: &str) -> Result<()> {
        let status = tokio::process::Command::new("systemctl")
            .arg("restart")
            .arg(target)
            .status()
            .await
            .with_context(|| format!("Failed to spawn systemctl for '{}'", target))?;
        if !status.success() {
            anyhow::bail!("systemctl restart {} exited with {}", target, status);
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
