// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lock Manager & Stale-Lock Reaper
//!
//! Non-blocking token locks over shared resources. Acquisition fails
//! immediately when the resource is held (no queueing; callers own their
//! retry policy). The background reaper is the single mechanism keeping
//! one unresponsive participant from deadlocking the fleet: it force
//! removes any lock older than `max_lock_age` and records every removal
//! in the append-only audit log.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::domain::config::LockConfig;
use crate::domain::events::FleetEvent;
use crate::domain::lock::{Lock, LockError, LockToken};
use crate::infrastructure::audit_log::{AuditLog, AuditReason, AuditRecord};
use crate::infrastructure::event_bus::EventBus;

pub struct LockManager {
    locks: RwLock<HashMap<String, Lock>>,
    config: LockConfig,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
}

impl LockManager {
    pub fn new(config: LockConfig, audit: Arc<AuditLog>, event_bus: Arc<EventBus>) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            config,
            audit,
            event_bus,
        }
    }

    /// Acquire `resource_id` for `holder_id`, failing fast if held.
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
    ) -> Result<LockToken, LockError> {
        let mut locks = self.locks.write().await;
        if let Some(existing) = locks.get(resource_id) {
            return Err(LockError::AlreadyHeld {
                resource_id: resource_id.to_string(),
                holder_id: existing.holder_id.clone(),
            });
        }
        let lock = Lock::new(resource_id, holder_id, self.config.default_ttl);
        let token = lock.token;
        locks.insert(resource_id.to_string(), lock);
        info!(resource_id, holder_id, "Lock acquired");
        Ok(token)
    }

    /// Release with proof of ownership
    pub async fn release(&self, resource_id: &str, token: LockToken) -> Result<(), LockError> {
        let mut locks = self.locks.write().await;
        let lock = locks
            .get(resource_id)
            .ok_or_else(|| LockError::NotHeld(resource_id.to_string()))?;
        if lock.token != token {
            return Err(LockError::InvalidToken(resource_id.to_string()));
        }
        locks.remove(resource_id);
        info!(resource_id, "Lock released");
        Ok(())
    }

    /// Administrative removal without a token; audited like a reap.
    pub async fn force_release(&self, resource_id: &str) -> Result<(), LockError> {
        let removed = {
            let mut locks = self.locks.write().await;
            locks
                .remove(resource_id)
                .ok_or_else(|| LockError::NotHeld(resource_id.to_string()))?
        };
        warn!(resource_id, holder_id = %removed.holder_id, "Lock force-released");
        self.record_removal(&removed, AuditReason::ForceRelease, Utc::now())
            .await;
        Ok(())
    }

    /// One reaper pass: force-remove every lock older than
    /// `max_lock_age`, tolerating per-resource failures so one bad
    /// record cannot abort the rest of the scan.
    pub async fn reap_once(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<Lock> = {
            let locks = self.locks.read().await;
            locks
                .values()
                .filter(|lock| lock.is_stale(now, self.config.max_lock_age))
                .cloned()
                .collect()
        };

        let mut reaped = 0;
        for lock in stale {
            // Re-check under the write guard: the holder may have
            // released between the scan and now.
            let removed = {
                let mut locks = self.locks.write().await;
                match locks.get(&lock.resource_id) {
                    Some(current)
                        if current.token == lock.token
                            && current.is_stale(now, self.config.max_lock_age) =>
                    {
                        locks.remove(&lock.resource_id)
                    }
                    _ => None,
                }
            };
            let Some(removed) = removed else { continue };

            warn!(
                resource_id = %removed.resource_id,
                holder_id = %removed.holder_id,
                age_seconds = removed.age(now).as_secs(),
                "Stale lock reaped"
            );
            self.record_removal(&removed, AuditReason::StaleReap, now).await;
            self.event_bus.publish(FleetEvent::LockReaped {
                resource_id: removed.resource_id.clone(),
                holder_id: removed.holder_id.clone(),
                age_seconds: removed.age(now).as_secs(),
                at: now,
            });
            reaped += 1;
        }
        reaped
    }

    /// Spawn the periodic reaper. Runs independently of every other
    /// component; an audit failure for one resource is logged and the
    /// scan continues.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reaped = manager.reap_once(Utc::now()).await;
                if reaped > 0 {
                    info!(reaped, "Reaper pass removed stale locks");
                }
            }
        })
    }

    pub async fn list(&self) -> Vec<Lock> {
        let mut all: Vec<Lock> = self.locks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        all
    }

    pub async fn export(&self) -> Vec<Lock> {
        self.locks.read().await.values().cloned().collect()
    }

    pub async fn import(&self, snapshot: Vec<Lock>) {
        let mut locks = self.locks.write().await;
        for lock in snapshot {
            locks.entry(lock.resource_id.clone()).or_insert(lock);
        }
    }

    // `now` is the clock of the pass that decided the removal, so the
    // logged age matches the age the staleness check saw.
    async fn record_removal(&self, lock: &Lock, reason: AuditReason, now: DateTime<Utc>) {
        let record = AuditRecord {
            resource_id: lock.resource_id.clone(),
            holder_id: lock.holder_id.clone(),
            age_seconds: lock.age(now).as_secs(),
            reason,
            recorded_at: now,
        };
        if let Err(e) = self.audit.append(&record).await {
            // The removal stands; losing one audit line must not stall
            // the reaper.
            error!(resource_id = %lock.resource_id, error = %e, "Failed to append audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn manager(dir: &tempfile::TempDir) -> Arc<LockManager> {
        Arc::new(LockManager::new(
            LockConfig {
                reap_interval: Duration::from_secs(60),
                max_lock_age: Duration::from_secs(300),
                default_ttl: Duration::from_secs(120),
            },
            Arc::new(AuditLog::new(dir.path().join("reaps.jsonl"))),
            Arc::new(EventBus::with_default_capacity()),
        ))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let token = manager.acquire("resource-1", "holder-a").await.unwrap();
        let err = manager.acquire("resource-1", "holder-b").await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));

        manager.release("resource-1", token).await.unwrap();
        manager.acquire("resource-1", "holder-b").await.unwrap();
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        manager.acquire("resource-1", "holder-a").await.unwrap();
        let err = manager
            .release("resource-1", LockToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidToken(_)));

        let err = manager.release("ghost", LockToken::new()).await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld(_)));
    }

    #[tokio::test]
    async fn test_reaper_removes_stale_lock_and_audits_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let audit = AuditLog::new(dir.path().join("reaps.jsonl"));

        manager.acquire("resource-1", "holder-a").await.unwrap();
        manager.acquire("resource-2", "holder-b").await.unwrap();

        // Advance the virtual clock past max_lock_age instead of sleeping
        let future = Utc::now() + ChronoDuration::seconds(301);
        let reaped = manager.reap_once(future).await;
        assert_eq!(reaped, 2);

        // Next holder succeeds immediately
        manager.acquire("resource-1", "holder-c").await.unwrap();

        let records = audit.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.reason == AuditReason::StaleReap));
        assert!(records.iter().all(|r| r.age_seconds >= 300));

        // A second pass finds nothing: removal is recorded exactly once
        assert_eq!(manager.reap_once(future).await, 0);
        assert_eq!(audit.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_locks_survive_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.acquire("resource-1", "holder-a").await.unwrap();
        assert_eq!(manager.reap_once(Utc::now()).await, 0);
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_force_release_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let audit = AuditLog::new(dir.path().join("reaps.jsonl"));

        manager.acquire("resource-1", "holder-a").await.unwrap();
        manager.force_release("resource-1").await.unwrap();

        let records = audit.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, AuditReason::ForceRelease);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.acquire("resource-1", "holder-a").await.unwrap();

        let exported = manager.export().await;
        let restored = self::manager(&dir);
        restored.import(exported).await;

        let err = restored.acquire("resource-1", "holder-b").await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
    }
}
