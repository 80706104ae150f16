// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for the gateway admin API

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn gateway_health(&self) -> Result<serde_json::Value> {
        self.get_json("/health").await
    }

    pub async fn list_devices(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/devices").await
    }

    pub async fn get_device(&self, device_id: &str) -> Result<serde_json::Value> {
        self.get_json(&format!("/api/v1/devices/{}", device_id)).await
    }

    pub async fn register_device(&self, registration: serde_json::Value) -> Result<String> {
        #[derive(Deserialize)]
        struct RegisterResponse {
            device_id: String,
        }
        let response: RegisterResponse = self
            .post_json("/api/v1/devices", &registration)
            .await
            .context("Failed to register device")?;
        Ok(response.device_id)
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        self.delete(&format!("/api/v1/devices/{}", device_id)).await
    }

    pub async fn submit_task(&self, request: serde_json::Value) -> Result<Uuid> {
        #[derive(Deserialize)]
        struct SubmitResponse {
            task_id: Uuid,
        }
        let response: SubmitResponse = self
            .post_json("/api/v1/tasks", &request)
            .await
            .context("Failed to submit task")?;
        Ok(response.task_id)
    }

    pub async fn task_status(&self, task_id: Uuid) -> Result<serde_json::Value> {
        self.get_json(&format!("/api/v1/tasks/{}", task_id)).await
    }

    pub async fn list_tasks(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/tasks").await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(&format!("/api/v1/tasks/{}/cancel", task_id), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    pub async fn list_locks(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/locks").await
    }

    pub async fn acquire_lock(&self, resource_id: &str, holder_id: &str) -> Result<Uuid> {
        #[derive(Deserialize)]
        struct AcquireResponse {
            token: Uuid,
        }
        let response: AcquireResponse = self
            .post_json(
                "/api/v1/locks",
                &serde_json::json!({ "resource_id": resource_id, "holder_id": holder_id }),
            )
            .await
            .context("Failed to acquire lock")?;
        Ok(response.token)
    }

    pub async fn release_lock(&self, resource_id: &str, token: Uuid) -> Result<()> {
        let url = format!("{}/api/v1/locks/{}/release", self.base_url, resource_id);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("Failed to release lock")?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn force_release_lock(&self, resource_id: &str) -> Result<()> {
        self.delete(&format!("/api/v1/locks/{}", resource_id)).await
    }

    pub async fn open_transfer(&self, request: serde_json::Value) -> Result<Uuid> {
        #[derive(Deserialize)]
        struct OpenResponse {
            transfer_id: Uuid,
        }
        let response: OpenResponse = self
            .post_json("/api/v1/transfers", &request)
            .await
            .context("Failed to open transfer")?;
        Ok(response.transfer_id)
    }

    /// Upload one raw chunk; returns the gateway's contiguous offset.
    pub async fn upload_chunk(
        &self,
        transfer_id: Uuid,
        index: usize,
        chunk: Bytes,
        checksum: &str,
    ) -> Result<u64> {
        #[derive(Deserialize)]
        struct ChunkResponse {
            resume_offset: u64,
        }
        let url = format!(
            "{}/api/v1/transfers/{}/chunks/{}",
            self.base_url, transfer_id, index
        );
        let response = self
            .client
            .put(&url)
            .header("x-chunk-checksum", checksum)
            .body(chunk)
            .send()
            .await
            .with_context(|| format!("Failed to upload chunk {}", index))?;
        let response = Self::check(response).await?;
        let parsed: ChunkResponse = response.json().await.context("Failed to parse chunk response")?;
        Ok(parsed.resume_offset)
    }

    pub async fn resume_transfer(&self, transfer_id: Uuid) -> Result<u64> {
        #[derive(Deserialize)]
        struct ResumeResponse {
            resume_offset: u64,
        }
        let response: ResumeResponse = self
            .post_json(
                &format!("/api/v1/transfers/{}/resume", transfer_id),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.resume_offset)
    }

    pub async fn complete_transfer(&self, transfer_id: Uuid) -> Result<serde_json::Value> {
        self.post_json(
            &format!("/api/v1/transfers/{}/complete", transfer_id),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn transfer_status(&self, transfer_id: Uuid) -> Result<serde_json::Value> {
        self.get_json(&format!("/api/v1/transfers/{}", transfer_id)).await
    }

    pub async fn list_transfers(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/transfers").await
    }

    pub async fn health_targets(&self) -> Result<serde_json::Value> {
        self.get_json("/api/v1/health/targets").await
    }

    pub async fn probe_target(&self, target: &str) -> Result<serde_json::Value> {
        self.post_json(
            &format!("/api/v1/health/targets/{}/probe", target),
            &serde_json::json!({}),
        )
        .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Request to {} failed", path))?;
        Self::check(response).await?;
        Ok(())
    }

    /// Turn non-2xx answers into errors carrying the gateway's message
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(body);
        anyhow::bail!("Gateway returned {}: {}", status, detail)
    }
}
