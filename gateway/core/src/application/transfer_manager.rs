// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Transfer Manager
//!
//! Opens and drives chunked transfer sessions between devices. At session
//! open the manager probes for a direct peer-to-peer path within a fixed
//! budget; when the probe fails or times out the session falls back to
//! relayed transport through the gateway. Mode is negotiated once per
//! session and never changes mid-transfer.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::config::TransferConfig;
use crate::domain::device::DeviceId;
use crate::domain::events::FleetEvent;
use crate::domain::transfer::{
    PayloadDescriptor, TransferError, TransferId, TransferSession, TransferStatus, TransportMode,
};
use crate::infrastructure::event_bus::EventBus;

/// Probes whether two devices can reach each other directly
#[async_trait]
pub trait PathDiscovery: Send + Sync {
    async fn probe_direct(&self, source: &DeviceId, target: &DeviceId) -> bool;
}

/// Discovery against an address reflector: a direct path exists when both
/// endpoints have a publicly reflected address.
pub struct ReflectorDiscovery {
    client: reqwest::Client,
    reflector_url: String,
}

impl ReflectorDiscovery {
    pub fn new(reflector_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            reflector_url: reflector_url.into(),
        }
    }

    async fn reflected_address(&self, device: &DeviceId) -> Option<String> {
        let url = format!("{}/reflect/{}", self.reflector_url.trim_end_matches('/'), device);
        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        body["address"].as_str().map(str::to_string)
    }
}

/// Discovery stub for deployments without a reflector: every session
/// relays through the gateway.
pub struct RelayOnlyDiscovery;

#[async_trait]
impl PathDiscovery for RelayOnlyDiscovery {
    async fn probe_direct(&self, _source: &DeviceId, _target: &DeviceId) -> bool {
        false
    }
}

#[async_trait]
impl PathDiscovery for ReflectorDiscovery {
    async fn probe_direct(&self, source: &DeviceId, target: &DeviceId) -> bool {
        let (a, b) = tokio::join!(
            self.reflected_address(source),
            self.reflected_address(target)
        );
        a.is_some() && b.is_some()
    }
}

pub struct TransferManager {
    sessions: RwLock<HashMap<TransferId, TransferSession>>,
    config: TransferConfig,
    discovery: Arc<dyn PathDiscovery>,
    event_bus: Arc<EventBus>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        discovery: Arc<dyn PathDiscovery>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            discovery,
            event_bus,
        }
    }

    /// Open a session, negotiating the transport mode within the
    /// direct-path budget.
    pub async fn open(
        &self,
        descriptor: PayloadDescriptor,
        source: &DeviceId,
        target: &DeviceId,
    ) -> Result<TransferId, TransferError> {
        let mode = self.negotiate(source, target).await;
        let session = TransferSession::new(descriptor, self.config.chunk_size, mode)?;
        let id = session.id;
        info!(
            transfer_id = %id,
            name = %session.descriptor.name,
            total_size = session.descriptor.total_size,
            chunks = session.chunk_count(),
            mode = ?mode,
            "Transfer session opened"
        );
        self.sessions.write().await.insert(id, session);
        Ok(id)
    }

    async fn negotiate(&self, source: &DeviceId, target: &DeviceId) -> TransportMode {
        let probe = self.discovery.probe_direct(source, target);
        match tokio::time::timeout(self.config.direct_path_timeout, probe).await {
            Ok(true) => TransportMode::PeerToPeer,
            Ok(false) => {
                debug!(source = %source, target = %target, "No direct path, relaying");
                TransportMode::Relayed
            }
            Err(_) => {
                debug!(source = %source, target = %target, "Path discovery timed out, relaying");
                TransportMode::Relayed
            }
        }
    }

    /// Commit one chunk; returns the new contiguous resume offset.
    pub async fn submit_chunk(
        &self,
        id: TransferId,
        index: usize,
        bytes: Bytes,
        chunk_checksum: &str,
    ) -> Result<u64, TransferError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        session.commit_chunk(index, bytes, chunk_checksum)?;
        Ok(session.resume_offset())
    }

    /// Resume handshake after a disconnect: checkpoints the contiguous
    /// frontier and reports it so the sender restarts from there, never
    /// from zero. Sessions past the resume budget are abandoned.
    pub async fn resume(&self, id: TransferId) -> Result<u64, TransferError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        if session.state != crate::domain::transfer::TransferState::Active {
            return Err(TransferError::SessionNotActive(id));
        }
        if session.resume_attempts >= self.config.max_resume_attempts {
            warn!(transfer_id = %id, attempts = session.resume_attempts, "Resume budget exhausted, abandoning");
            session.abandon();
            return Err(TransferError::ResumeExhausted(id));
        }
        let offset = session.checkpoint();
        info!(transfer_id = %id, resume_offset = offset, "Transfer resumed");
        Ok(offset)
    }

    /// Finalize a full session: verify the whole payload and return it.
    ///
    /// A whole-payload mismatch rolls the session back to its last
    /// checkpoint (see `TransferSession::finalize`); once the resume
    /// budget is spent the session is abandoned instead.
    pub async fn complete(&self, id: TransferId) -> Result<Bytes, TransferError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        match session.finalize() {
            Ok(payload) => {
                info!(transfer_id = %id, bytes = payload.len(), "Transfer complete");
                self.event_bus.publish(FleetEvent::TransferCompleted {
                    transfer_id: id,
                    total_size: session.descriptor.total_size,
                    at: Utc::now(),
                });
                Ok(payload)
            }
            Err(TransferError::ChecksumMismatch { expected })
                if session.resume_attempts >= self.config.max_resume_attempts =>
            {
                warn!(transfer_id = %id, expected = %expected, "Checksum mismatch past resume budget, abandoning");
                session.abandon();
                Err(TransferError::ResumeExhausted(id))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn abandon(&self, id: TransferId) -> Result<(), TransferError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        session.abandon();
        warn!(transfer_id = %id, "Transfer abandoned");
        Ok(())
    }

    pub async fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.sessions.read().await.get(id).map(TransferStatus::from)
    }

    pub async fn list(&self) -> Vec<TransferStatus> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<TransferStatus> = sessions.values().map(TransferStatus::from).collect();
        all.sort_by_key(|s| s.id.0);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::domain::transfer::{digest_hex, TransferState};

    struct MockDiscovery {
        direct: bool,
        delay: Duration,
    }

    #[async_trait]
    impl PathDiscovery for MockDiscovery {
        async fn probe_direct(&self, _source: &DeviceId, _target: &DeviceId) -> bool {
            tokio::time::sleep(self.delay).await;
            self.direct
        }
    }

    fn manager(direct: bool, delay: Duration) -> TransferManager {
        TransferManager::new(
            TransferConfig {
                chunk_size: 10,
                direct_path_timeout: Duration::from_millis(50),
                max_resume_attempts: 2,
                reflector_url: None,
            },
            Arc::new(MockDiscovery { direct, delay }),
            Arc::new(EventBus::with_default_capacity()),
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn descriptor(data: &[u8]) -> PayloadDescriptor {
        PayloadDescriptor {
            name: "fleet-update.bin".to_string(),
            total_size: data.len() as u64,
            checksum: digest_hex(data),
        }
    }

    fn chunk_of(data: &[u8], index: usize) -> Bytes {
        let start = index * 10;
        let end = (start + 10).min(data.len());
        Bytes::copy_from_slice(&data[start..end])
    }

    #[tokio::test]
    async fn test_direct_probe_yields_peer_to_peer() {
        let manager = manager(true, Duration::from_millis(1));
        let data = payload(30);
        let id = manager
            .open(descriptor(&data), &DeviceId::new("a"), &DeviceId::new("b"))
            .await
            .unwrap();
        let status = manager.status(&id).await.unwrap();
        assert_eq!(status.transport_mode, TransportMode::PeerToPeer);
    }

    #[tokio::test]
    async fn test_slow_discovery_falls_back_to_relay() {
        // Discovery answers "direct" but only after the budget expires
        let manager = manager(true, Duration::from_millis(200));
        let data = payload(30);
        let id = manager
            .open(descriptor(&data), &DeviceId::new("a"), &DeviceId::new("b"))
            .await
            .unwrap();
        let status = manager.status(&id).await.unwrap();
        assert_eq!(status.transport_mode, TransportMode::Relayed);
    }

    #[tokio::test]
    async fn test_interrupted_transfer_resumes_from_frontier() {
        let manager = manager(false, Duration::from_millis(1));
        let data = payload(100);
        let id = manager
            .open(descriptor(&data), &DeviceId::new("a"), &DeviceId::new("b"))
            .await
            .unwrap();

        // Chunks 0..=3 arrive, the connection drops before 4..=9
        for i in 0..4 {
            let chunk = chunk_of(&data, i);
            let sum = digest_hex(&chunk);
            manager.submit_chunk(id, i, chunk, &sum).await.unwrap();
        }

        let offset = manager.resume(id).await.unwrap();
        assert_eq!(offset, 40);

        for i in 4..10 {
            let chunk = chunk_of(&data, i);
            let sum = digest_hex(&chunk);
            manager.submit_chunk(id, i, chunk, &sum).await.unwrap();
        }
        let reassembled = manager.complete(id).await.unwrap();
        assert_eq!(&reassembled[..], &data[..]);
        assert_eq!(
            manager.status(&id).await.unwrap().state,
            TransferState::Complete
        );
    }

    #[tokio::test]
    async fn test_resume_budget_exhaustion_abandons() {
        let manager = manager(false, Duration::from_millis(1));
        let data = payload(30);
        // Lie about the whole-payload checksum so finalize always fails
        let mut desc = descriptor(&data);
        desc.checksum = digest_hex(b"wrong");
        let id = manager
            .open(desc, &DeviceId::new("a"), &DeviceId::new("b"))
            .await
            .unwrap();

        for round in 0..2 {
            for i in 0..3 {
                let chunk = chunk_of(&data, i);
                let sum = digest_hex(&chunk);
                manager.submit_chunk(id, i, chunk, &sum).await.unwrap();
            }
            let err = manager.complete(id).await.unwrap_err();
            if round == 0 {
                assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
            } else {
                // Second mismatch hits the budget of 2 resume attempts
                assert!(matches!(err, TransferError::ResumeExhausted(_)));
            }
        }
        assert_eq!(
            manager.status(&id).await.unwrap().state,
            TransferState::Abandoned
        );
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let manager = manager(false, Duration::from_millis(1));
        let err = manager
            .submit_chunk(TransferId::new(), 0, Bytes::from_static(b"x"), "00")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }
}
