// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Device Transport
//!
//! The seam between the router and the network: a transport delivers one
//! encoded envelope to a device and returns the envelope the device
//! answered with. The HTTP implementation posts AIP frames to the
//! device's registered endpoint; tests substitute a mock.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::domain::device::Device;
use crate::domain::message::Envelope;
use crate::infrastructure::codec::{self, DecodeError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device '{device}' unreachable: {detail}")]
    Unreachable { device: String, detail: String },

    #[error("Dispatch to '{device}' timed out")]
    Timeout { device: String },

    #[error("Device '{device}' answered with an undecodable frame: {source}")]
    BadResponse {
        device: String,
        #[source]
        source: DecodeError,
    },
}

/// Request/response delivery of one envelope to one device
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn send(&self, device: &Device, envelope: &Envelope)
        -> Result<Envelope, TransportError>;
}

/// HTTP transport posting AIP frames to `{endpoint}/aip`
pub struct HttpDeviceTransport {
    client: reqwest::Client,
}

impl HttpDeviceTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeviceTransport for HttpDeviceTransport {
    async fn send(
        &self,
        device: &Device,
        envelope: &Envelope,
    ) -> Result<Envelope, TransportError> {
        let url = format!("{}/aip", device.endpoint.trim_end_matches('/'));
        debug!(device = %device.id, url = %url, message_id = %envelope.message_id, "Dispatching envelope");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .body(codec::encode(envelope))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        device: device.id.to_string(),
                    }
                } else {
                    TransportError::Unreachable {
                        device: device.id.to_string(),
                        detail: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Unreachable {
                device: device.id.to_string(),
                detail: format!("HTTP {}", status),
            });
        }

        let bytes = response.bytes().await.map_err(|e| TransportError::Unreachable {
            device: device.id.to_string(),
            detail: e.to_string(),
        })?;

        codec::decode(&bytes).map_err(|source| TransportError::BadResponse {
            device: device.id.to_string(),
            source,
        })
    }
}
