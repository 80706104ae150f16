// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Capability Provider Interface
//!
//! The external collaborator seam replacing the per-domain adapter
//! catalogue: a provider exposes `execute(command, params)` and a
//! `health()` probe, nothing else. Providers are resolved once at startup
//! into a registry table keyed by capability tag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::domain::device::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Command '{0}' not supported")]
    UnsupportedCommand(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator exposing one capability
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError>;

    async fn health(&self) -> HealthReport;
}

/// Startup-resolved table mapping capability tag to provider
///
/// The static replacement for runtime plugin discovery: extensibility
/// stays (register any implementation at boot), reflection goes.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Capability, Arc<dyn CapabilityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        capability: Capability,
        provider: Arc<dyn CapabilityProvider>,
    ) {
        info!(capability = %capability, "Registering capability provider");
        self.providers.insert(capability, provider);
    }

    pub fn resolve(&self, capability: &Capability) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.get(capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut tags: Vec<Capability> = self.providers.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl CapabilityProvider for EchoProvider {
        async fn execute(
            &self,
            command: &str,
            params: &serde_json::Value,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({ "command": command, "params": params }))
        }

        async fn health(&self) -> HealthReport {
            HealthReport::healthy()
        }
    }

    #[tokio::test]
    async fn test_registry_resolution() {
        let mut registry = ProviderRegistry::new();
        registry.register(Capability::new("echo"), Arc::new(EchoProvider));

        let provider = registry.resolve(&Capability::new("echo")).unwrap();
        let out = provider
            .execute("ping", &serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(out["command"], "ping");

        assert!(registry.resolve(&Capability::new("missing")).is_none());
    }
}
