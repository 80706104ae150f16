// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Wire Message Envelope (AIP)
//!
//! Defines the protocol envelope exchanged between the gateway and device
//! agents. Every message carries a globally unique `message_id` used for
//! de-duplication and a `correlation_id` linking a `result` back to the
//! `command` that produced it.
//!
//! # Invariant
//!
//! Every `command` eventually produces exactly one terminal `result` or
//! `error` with a matching `correlation_id`, or is abandoned after its
//! retries are exhausted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::device::DeviceId;

/// Globally unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation identifier linking a result/error back to its command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message kinds understood by both wire dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Heartbeat,
    HeartbeatAck,
    Command,
    Result,
    Error,
    TransferChunk,
    TransferAck,
}

impl MessageType {
    /// Parse a wire `type` field (shared by both dialects)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(Self::Register),
            "heartbeat" => Some(Self::Heartbeat),
            "heartbeat_ack" => Some(Self::HeartbeatAck),
            "command" => Some(Self::Command),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            "transfer_chunk" => Some(Self::TransferChunk),
            "transfer_ack" => Some(Self::TransferAck),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Command => "command",
            Self::Result => "result",
            Self::Error => "error",
            Self::TransferChunk => "transfer_chunk",
            Self::TransferAck => "transfer_ack",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol envelope
///
/// The `payload` is an opaque structured body whose schema depends on
/// `message_type`; the codec never interprets it beyond JSON validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub source_id: DeviceId,
    pub target_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a new envelope with a fresh message id and current timestamp
    pub fn new(
        message_type: MessageType,
        source_id: DeviceId,
        target_id: DeviceId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol_version: crate::infrastructure::codec::PROTOCOL_VERSION.to_string(),
            message_id: MessageId::new(),
            message_type,
            source_id,
            target_id,
            timestamp: Utc::now(),
            correlation_id: None,
            retry_count: 0,
            payload,
        }
    }

    /// Build a `command` envelope with a fresh correlation id
    pub fn command(
        source_id: DeviceId,
        target_id: DeviceId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id: Some(CorrelationId::new()),
            ..Self::new(MessageType::Command, source_id, target_id, payload)
        }
    }

    /// Build the terminal `result` answering `command`
    pub fn result_for(command: &Envelope, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: command.correlation_id,
            ..Self::new(
                MessageType::Result,
                command.target_id.clone(),
                command.source_id.clone(),
                payload,
            )
        }
    }

    /// Build the terminal `error` answering `command`
    pub fn error_for(command: &Envelope, error: impl Into<String>) -> Self {
        Self {
            correlation_id: command.correlation_id,
            ..Self::new(
                MessageType::Error,
                command.target_id.clone(),
                command.source_id.clone(),
                serde_json::json!({ "error": error.into() }),
            )
        }
    }

    /// Build a `heartbeat_ack` carrying the gateway clock
    pub fn heartbeat_ack(heartbeat: &Envelope, gateway_id: DeviceId) -> Self {
        Self {
            correlation_id: heartbeat.correlation_id,
            ..Self::new(
                MessageType::HeartbeatAck,
                gateway_id,
                heartbeat.source_id.clone(),
                serde_json::json!({ "gateway_time": Utc::now() }),
            )
        }
    }

    /// A retransmission of this envelope: same identity, bumped retry count
    pub fn retransmission(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    /// Whether this message terminates a command exchange
    pub fn is_terminal(&self) -> bool {
        matches!(self.message_type, MessageType::Result | MessageType::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for t in [
            MessageType::Register,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Command,
            MessageType::Result,
            MessageType::Error,
            MessageType::TransferChunk,
            MessageType::TransferAck,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("bogus"), None);
    }

    #[test]
    fn test_result_carries_correlation() {
        let cmd = Envelope::command(
            DeviceId::gateway(),
            DeviceId::new("device-a"),
            serde_json::json!({ "command": "ocr" }),
        );
        assert!(cmd.correlation_id.is_some());

        let result = Envelope::result_for(&cmd, serde_json::json!({ "text": "ok" }));
        assert_eq!(result.correlation_id, cmd.correlation_id);
        assert_eq!(result.source_id, cmd.target_id);
        assert_eq!(result.target_id, cmd.source_id);
        assert!(result.is_terminal());
    }

    #[test]
    fn test_retransmission_keeps_message_id() {
        let cmd = Envelope::command(
            DeviceId::gateway(),
            DeviceId::new("device-a"),
            serde_json::json!({}),
        );
        let retry = cmd.retransmission();
        assert_eq!(retry.message_id, cmd.message_id);
        assert_eq!(retry.retry_count, 1);
    }
}
