// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Wire Protocol Codec (AIP)
//!
//! Pure transformation between [`Envelope`] values and wire bytes. The
//! codec accepts two JSON dialects concurrently:
//!
//! - **current**, identified by `{version, type, device_id}`
//! - **legacy**, identified by `{protocol, message_id, type, from}`
//!
//! Dialect detection is an explicit tagged dispatch, not string-matching
//! fallthrough; any input matching neither shape decodes to
//! [`DecodeError::UnknownDialect`]. Decoding is total (never panics on
//! malformed input) and encoding is deterministic for a given envelope
//! (`serde_json::Map` keeps keys sorted), which retransmission and
//! checksumming rely on.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::device::DeviceId;
use crate::domain::message::{CorrelationId, Envelope, MessageId, MessageType};

/// Version emitted for the current dialect
pub const PROTOCOL_VERSION: &str = "2.0";

/// Wire dialect detected on an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Current,
    Legacy,
}

impl Dialect {
    /// Classify a decoded JSON object by its identifying field set
    fn detect(object: &Map<String, Value>) -> Option<Dialect> {
        if object.contains_key("version")
            && object.contains_key("type")
            && object.contains_key("device_id")
        {
            return Some(Dialect::Current);
        }
        if object.contains_key("protocol")
            && object.contains_key("message_id")
            && object.contains_key("type")
            && object.contains_key("from")
        {
            return Some(Dialect::Legacy);
        }
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame matches neither wire dialect")]
    UnknownDialect,

    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("Missing or malformed field '{field}' ({dialect:?} dialect)")]
    MissingField {
        field: &'static str,
        dialect: Dialect,
    },
}

/// Encode an envelope in the current dialect.
///
/// Field order is stable for a given envelope value, so encoding the same
/// message twice yields byte-identical frames.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut object = Map::new();
    object.insert(
        "version".to_string(),
        Value::String(envelope.protocol_version.clone()),
    );
    object.insert(
        "type".to_string(),
        Value::String(envelope.message_type.as_str().to_string()),
    );
    object.insert(
        "device_id".to_string(),
        Value::String(envelope.source_id.as_str().to_string()),
    );
    object.insert(
        "target_id".to_string(),
        Value::String(envelope.target_id.as_str().to_string()),
    );
    object.insert(
        "message_id".to_string(),
        Value::String(envelope.message_id.to_string()),
    );
    object.insert(
        "timestamp".to_string(),
        Value::String(envelope.timestamp.to_rfc3339()),
    );
    if let Some(correlation_id) = envelope.correlation_id {
        object.insert(
            "correlation_id".to_string(),
            Value::String(correlation_id.to_string()),
        );
    }
    object.insert(
        "retry_count".to_string(),
        Value::Number(envelope.retry_count.into()),
    );
    object.insert("payload".to_string(), envelope.payload.clone());

    // serde_json::Map is BTreeMap-backed: serialization order is the key
    // order, independent of insertion order.
    serde_json::to_vec(&Value::Object(object)).unwrap_or_default()
}

/// Decode a wire frame from either dialect
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    match Dialect::detect(object) {
        Some(Dialect::Current) => decode_current(object),
        Some(Dialect::Legacy) => decode_legacy(object),
        None => Err(DecodeError::UnknownDialect),
    }
}

fn decode_current(object: &Map<String, Value>) -> Result<Envelope, DecodeError> {
    let dialect = Dialect::Current;
    let message_type = parse_type(object, dialect)?;
    let source_id = required_str(object, "device_id", dialect)?;

    let message_id = match object.get("message_id").and_then(Value::as_str) {
        Some(raw) => MessageId::from_uuid(parse_uuid(raw, "message_id", dialect)?),
        None => MessageId::new(),
    };

    Ok(Envelope {
        protocol_version: required_str(object, "version", dialect)?.to_string(),
        message_id,
        message_type,
        source_id: DeviceId::new(source_id),
        target_id: optional_device(object, "target_id"),
        timestamp: parse_timestamp(object),
        correlation_id: parse_correlation(object, dialect)?,
        retry_count: object
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        payload: object.get("payload").cloned().unwrap_or(Value::Null),
    })
}

fn decode_legacy(object: &Map<String, Value>) -> Result<Envelope, DecodeError> {
    let dialect = Dialect::Legacy;
    let message_type = parse_type(object, dialect)?;
    let source_id = required_str(object, "from", dialect)?;
    let message_id_raw = required_str(object, "message_id", dialect)?;

    Ok(Envelope {
        protocol_version: required_str(object, "protocol", dialect)?.to_string(),
        message_id: MessageId::from_uuid(parse_uuid(message_id_raw, "message_id", dialect)?),
        message_type,
        source_id: DeviceId::new(source_id),
        target_id: optional_device(object, "to"),
        timestamp: parse_timestamp(object),
        correlation_id: parse_correlation(object, dialect)?,
        retry_count: object
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        payload: object.get("payload").cloned().unwrap_or(Value::Null),
    })
}

fn parse_type(
    object: &Map<String, Value>,
    dialect: Dialect,
) -> Result<MessageType, DecodeError> {
    let raw = required_str(object, "type", dialect)?;
    MessageType::parse(raw).ok_or_else(|| DecodeError::UnknownMessageType(raw.to_string()))
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
    dialect: Dialect,
) -> Result<&'a str, DecodeError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField { field, dialect })
}

fn parse_uuid(raw: &str, field: &'static str, dialect: Dialect) -> Result<Uuid, DecodeError> {
    Uuid::parse_str(raw).map_err(|_| DecodeError::MissingField { field, dialect })
}

fn parse_correlation(
    object: &Map<String, Value>,
    dialect: Dialect,
) -> Result<Option<CorrelationId>, DecodeError> {
    match object.get("correlation_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Ok(Some(CorrelationId(parse_uuid(
            raw,
            "correlation_id",
            dialect,
        )?))),
        Some(_) => Err(DecodeError::MissingField {
            field: "correlation_id",
            dialect,
        }),
    }
}

fn optional_device(object: &Map<String, Value>, field: &str) -> DeviceId {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(DeviceId::new)
        .unwrap_or_else(DeviceId::gateway)
}

fn parse_timestamp(object: &Map<String, Value>) -> DateTime<Utc> {
    object
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::command(
            DeviceId::gateway(),
            DeviceId::new("device-a"),
            serde_json::json!({ "command": "ocr", "params": { "lang": "en" } }),
        )
    }

    #[test]
    fn test_round_trip_current_dialect() {
        let envelope = sample();
        let bytes = encode(&envelope);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let envelope = sample();
        assert_eq!(encode(&envelope), encode(&envelope));
    }

    #[test]
    fn test_legacy_dialect_decodes() {
        let id = Uuid::new_v4();
        let frame = serde_json::json!({
            "protocol": "1.3",
            "message_id": id.to_string(),
            "type": "heartbeat",
            "from": "phone-7",
            "payload": { "battery": 81 }
        });
        let envelope = decode(&serde_json::to_vec(&frame).unwrap()).unwrap();
        assert_eq!(envelope.protocol_version, "1.3");
        assert_eq!(envelope.message_id, MessageId::from_uuid(id));
        assert_eq!(envelope.message_type, MessageType::Heartbeat);
        assert_eq!(envelope.source_id, DeviceId::new("phone-7"));
        // No explicit target in the legacy frame: addressed to the gateway
        assert_eq!(envelope.target_id, DeviceId::gateway());
        assert_eq!(envelope.payload["battery"], 81);
    }

    #[test]
    fn test_unknown_shape_is_invalid_not_panic() {
        let frame = br#"{ "hello": "world" }"#;
        assert!(matches!(decode(frame), Err(DecodeError::UnknownDialect)));
    }

    #[test]
    fn test_malformed_json_is_typed_error() {
        assert!(matches!(
            decode(b"{ not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(decode(b"42"), Err(DecodeError::NotAnObject)));
    }

    #[test]
    fn test_unknown_type_rejected_per_dialect() {
        let frame = serde_json::json!({
            "version": "2.0",
            "type": "teleport",
            "device_id": "device-a"
        });
        assert!(matches!(
            decode(&serde_json::to_vec(&frame).unwrap()),
            Err(DecodeError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_legacy_missing_field() {
        // Has protocol/message_id/type but no "from": neither dialect
        let frame = serde_json::json!({
            "protocol": "1.0",
            "message_id": Uuid::new_v4().to_string(),
            "type": "register"
        });
        assert!(matches!(
            decode(&serde_json::to_vec(&frame).unwrap()),
            Err(DecodeError::UnknownDialect)
        ));
    }
}
