// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Transfer Session Domain Model
//!
//! Resumable chunked transfer of bulk payloads. Chunks are fixed-size and
//! individually checksummed so a corrupt chunk can be re-requested without
//! restarting the whole transfer; out-of-order chunks ahead of the
//! contiguous frontier are buffered, not discarded.
//!
//! # Invariants
//!
//! - `resume_offset` is always the largest prefix length for which all
//!   chunks `0..k` are committed and individually checksum-verified.
//! - The session is complete only when every chunk is committed and the
//!   whole-payload checksum matches.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    PeerToPeer,
    Relayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Active,
    Complete,
    Abandoned,
}

/// SHA-256 digest, hex-encoded
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Descriptor supplied by the sender when opening a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub name: String,
    pub total_size: u64,
    /// Whole-payload SHA-256, hex-encoded
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: TransferId,
    pub descriptor: PayloadDescriptor,
    pub chunk_size: u64,
    pub transport_mode: TransportMode,
    pub state: TransferState,
    /// Committed chunk payloads; `None` slots are either unreceived or
    /// buffered out of order below.
    chunks: Vec<Option<Bytes>>,
    /// Contiguous offset known good at the last resume handshake; a
    /// whole-payload mismatch rolls back to here, never to zero.
    checkpoint_offset: u64,
    pub resume_attempts: u32,
    pub started_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn new(
        descriptor: PayloadDescriptor,
        chunk_size: u64,
        transport_mode: TransportMode,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        if descriptor.total_size == 0 {
            return Err(TransferError::EmptyPayload);
        }
        let count = descriptor.total_size.div_ceil(chunk_size) as usize;
        Ok(Self {
            id: TransferId::new(),
            descriptor,
            chunk_size,
            transport_mode,
            state: TransferState::Active,
            chunks: vec![None; count],
            checkpoint_offset: 0,
            resume_attempts: 0,
            started_at: Utc::now(),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Which chunk indices are committed
    pub fn received_bitmap(&self) -> Vec<bool> {
        self.chunks.iter().map(|c| c.is_some()).collect()
    }

    /// Expected byte length of chunk `index` (the tail chunk may be short)
    fn expected_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.chunk_size;
        (self.descriptor.total_size - start).min(self.chunk_size)
    }

    /// Commit one chunk after verifying its individual checksum.
    ///
    /// Out-of-order commits are accepted; they simply sit ahead of the
    /// contiguous frontier until the gap closes.
    pub fn commit_chunk(
        &mut self,
        index: usize,
        bytes: Bytes,
        chunk_checksum: &str,
    ) -> Result<(), TransferError> {
        if self.state != TransferState::Active {
            return Err(TransferError::SessionNotActive(self.id));
        }
        if index >= self.chunks.len() {
            return Err(TransferError::ChunkOutOfRange {
                index,
                count: self.chunks.len(),
            });
        }
        if bytes.len() as u64 != self.expected_len(index) {
            return Err(TransferError::ChunkSizeMismatch {
                index,
                expected: self.expected_len(index),
                actual: bytes.len() as u64,
            });
        }
        if digest_hex(&bytes) != chunk_checksum {
            return Err(TransferError::ChunkChecksumMismatch { index });
        }
        self.chunks[index] = Some(bytes);
        Ok(())
    }

    /// Largest contiguous committed byte offset (the resume point)
    pub fn resume_offset(&self) -> u64 {
        let mut offset = 0u64;
        for (index, chunk) in self.chunks.iter().enumerate() {
            match chunk {
                Some(_) => offset = (index as u64 + 1) * self.chunk_size,
                None => return offset.min(self.descriptor.total_size),
            }
        }
        offset.min(self.descriptor.total_size)
    }

    pub fn is_full(&self) -> bool {
        self.chunks.iter().all(|c| c.is_some())
    }

    /// Record the resume handshake: the receiver reported its contiguous
    /// frontier, so everything below it is mutually agreed good.
    pub fn checkpoint(&mut self) -> u64 {
        self.checkpoint_offset = self.resume_offset();
        self.checkpoint_offset
    }

    /// Verify the whole payload and close the session.
    ///
    /// A whole-payload mismatch drops every chunk past the last
    /// individually verified contiguous prefix and leaves the session
    /// active so the sender can resume, not restart.
    pub fn finalize(&mut self) -> Result<Bytes, TransferError> {
        if self.state != TransferState::Active {
            return Err(TransferError::SessionNotActive(self.id));
        }
        if !self.is_full() {
            return Err(TransferError::Incomplete {
                resume_offset: self.resume_offset(),
            });
        }

        let mut payload = Vec::with_capacity(self.descriptor.total_size as usize);
        for chunk in self.chunks.iter().flatten() {
            payload.extend_from_slice(chunk);
        }

        if digest_hex(&payload) != self.descriptor.checksum {
            // Roll back to the last resume checkpoint: chunks received
            // since then are suspect even though each passed its own
            // checksum (the checksums travelled the same broken path).
            let keep = (self.checkpoint_offset / self.chunk_size) as usize;
            for slot in self.chunks.iter_mut().skip(keep) {
                *slot = None;
            }
            self.resume_attempts += 1;
            return Err(TransferError::ChecksumMismatch {
                expected: self.descriptor.checksum.clone(),
            });
        }

        self.state = TransferState::Complete;
        Ok(Bytes::from(payload))
    }

    pub fn abandon(&mut self) {
        self.state = TransferState::Abandoned;
    }
}

/// Read view used by the admin surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStatus {
    pub id: TransferId,
    pub name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub committed_chunks: usize,
    pub resume_offset: u64,
    pub transport_mode: TransportMode,
    pub state: TransferState,
    pub resume_attempts: u32,
}

impl From<&TransferSession> for TransferStatus {
    fn from(session: &TransferSession) -> Self {
        Self {
            id: session.id,
            name: session.descriptor.name.clone(),
            total_size: session.descriptor.total_size,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count(),
            committed_chunks: session.received_bitmap().iter().filter(|b| **b).count(),
            resume_offset: session.resume_offset(),
            transport_mode: session.transport_mode,
            state: session.state,
            resume_attempts: session.resume_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Chunk size must be non-zero")]
    InvalidChunkSize,

    #[error("Payload must be non-empty")]
    EmptyPayload,

    #[error("Transfer session '{0}' not found")]
    NotFound(TransferId),

    #[error("Transfer session '{0}' is not active")]
    SessionNotActive(TransferId),

    #[error("Chunk index {index} out of range (session has {count} chunks)")]
    ChunkOutOfRange { index: usize, count: usize },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Checksum mismatch on chunk {index}")]
    ChunkChecksumMismatch { index: usize },

    #[error("Transfer incomplete, resume from offset {resume_offset}")]
    Incomplete { resume_offset: u64 },

    #[error("Whole-payload checksum mismatch (expected {expected})")]
    ChecksumMismatch { expected: String },

    #[error("Resume attempts exhausted for session '{0}'")]
    ResumeExhausted(TransferId),
}
