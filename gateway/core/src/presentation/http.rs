// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Gateway HTTP Surface
//!
//! Two faces on one router: the `/aip` endpoint speaks the wire protocol
//! to device agents (register, heartbeat), and `/api/v1` is the JSON admin
//! surface the CLI talks to.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::health::{HealthError, HealthMonitor};
use crate::application::lock_manager::LockManager;
use crate::application::registry::{DeviceRegistry, Registration};
use crate::application::router::TaskRouter;
use crate::application::transfer_manager::TransferManager;
use crate::domain::config::GatewayConfig;
use crate::domain::device::{Capability, DeviceError, DeviceId, DeviceType};
use crate::domain::lock::{LockError, LockToken};
use crate::domain::message::{Envelope, MessageType};
use crate::domain::task::{Subtask, SubtaskId, TaskError, TaskId};
use crate::domain::transfer::{PayloadDescriptor, TransferError, TransferId};
use crate::infrastructure::codec::{self, DecodeError};
use crate::infrastructure::event_bus::EventBus;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub router: Arc<TaskRouter>,
    pub locks: Arc<LockManager>,
    pub transfers: Arc<TransferManager>,
    pub health: Arc<HealthMonitor>,
    pub event_bus: Arc<EventBus>,
    pub config: Arc<GatewayConfig>,
    pub started_at: std::time::Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/aip", post(aip_ingest_handler))
        .route("/api/v1/devices", get(list_devices_handler).post(register_device_handler))
        .route(
            "/api/v1/devices/{device_id}",
            get(get_device_handler).delete(deregister_device_handler),
        )
        .route("/api/v1/tasks", get(list_tasks_handler).post(submit_task_handler))
        .route("/api/v1/tasks/{task_id}", get(get_task_handler))
        .route("/api/v1/tasks/{task_id}/cancel", post(cancel_task_handler))
        .route("/api/v1/locks", get(list_locks_handler).post(acquire_lock_handler))
        .route("/api/v1/locks/{resource_id}/release", post(release_lock_handler))
        .route("/api/v1/locks/{resource_id}", delete(force_release_lock_handler))
        .route("/api/v1/transfers", get(list_transfers_handler).post(open_transfer_handler))
        .route("/api/v1/transfers/{transfer_id}", get(get_transfer_handler))
        .route(
            "/api/v1/transfers/{transfer_id}/chunks/{index}",
            put(submit_chunk_handler),
        )
        .route("/api/v1/transfers/{transfer_id}/resume", post(resume_transfer_handler))
        .route("/api/v1/transfers/{transfer_id}/complete", post(complete_transfer_handler))
        .route("/api/v1/health/targets", get(health_targets_handler))
        .route("/api/v1/health/targets/{target}/probe", post(manual_probe_handler))
        .with_state(Arc::new(state))
}

/// Errors surfaced to API clients, mapped onto HTTP status codes
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Device(DeviceError::NotRegistered(_)) => StatusCode::NOT_FOUND,
            Self::Device(_) => StatusCode::CONFLICT,
            Self::Task(TaskError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Task(TaskError::AlreadyTerminal(_)) => StatusCode::CONFLICT,
            Self::Task(_) => StatusCode::BAD_REQUEST,
            Self::Lock(LockError::AlreadyHeld { .. }) => StatusCode::CONFLICT,
            Self::Lock(LockError::InvalidToken(_)) => StatusCode::FORBIDDEN,
            Self::Lock(LockError::NotHeld(_)) => StatusCode::NOT_FOUND,
            Self::Transfer(TransferError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Transfer(TransferError::ResumeExhausted(_)) => StatusCode::GONE,
            Self::Transfer(TransferError::ChecksumMismatch { .. }) => StatusCode::CONFLICT,
            Self::Transfer(TransferError::Incomplete { .. }) => StatusCode::CONFLICT,
            Self::Transfer(_) => StatusCode::BAD_REQUEST,
            Self::Health(HealthError::UnknownTarget(_)) => StatusCode::NOT_FOUND,
            Self::Decode(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = %status, error = %self, "Request rejected");
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "devices": state.registry.list().await.len(),
    }))
}

// ---------------------------------------------------------------------------
// AIP wire endpoint

/// Registration payload carried inside a `register` envelope
#[derive(Debug, Deserialize)]
struct RegisterPayload {
    device_type: DeviceType,
    capabilities: BTreeSet<Capability>,
    endpoint: String,
}

async fn aip_ingest_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let envelope = codec::decode(&body)?;
    let reply = match envelope.message_type {
        MessageType::Register => {
            let payload: RegisterPayload = serde_json::from_value(envelope.payload.clone())
                .map_err(|e| ApiError::BadRequest(format!("Invalid register payload: {}", e)))?;
            state
                .registry
                .register(Registration {
                    device_id: envelope.source_id.clone(),
                    device_type: payload.device_type,
                    capabilities: payload.capabilities,
                    endpoint: payload.endpoint,
                })
                .await;
            Envelope::result_for(&envelope, serde_json::json!({ "registered": true }))
        }
        MessageType::Heartbeat => {
            let load = envelope.payload["load"].as_f64();
            let known = state.registry.update_heartbeat(&envelope.source_id, load).await;
            if known {
                Envelope::heartbeat_ack(&envelope, DeviceId::gateway())
            } else {
                // Unknown sender: tell it to re-register
                warn!(device_id = %envelope.source_id, "Heartbeat from unknown device");
                Envelope::error_for(&envelope, "unknown device, re-register required")
            }
        }
        other => Envelope::error_for(&envelope, format!("unsupported message type '{}'", other)),
    };

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        codec::encode(&reply),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Devices

async fn list_devices_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "devices": state.registry.list().await }))
}

async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<Registration>,
) -> (StatusCode, Json<serde_json::Value>) {
    let device_id = registration.device_id.clone();
    state.registry.register(registration).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "device_id": device_id })),
    )
}

async fn get_device_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = DeviceId::new(device_id);
    let device = state
        .registry
        .get(&id)
        .await
        .ok_or(DeviceError::NotRegistered(id))?;
    Ok(Json(serde_json::to_value(device).unwrap_or_default()))
}

async fn deregister_device_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.deregister(&DeviceId::new(device_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tasks

#[derive(Debug, Deserialize)]
struct SubtaskSpec {
    id: String,
    capability: String,
    command: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default = "default_critical")]
    critical: bool,
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    goal: String,
    subtasks: Vec<SubtaskSpec>,
}

impl SubtaskSpec {
    fn into_subtask(self) -> Result<Subtask, TaskError> {
        let mut subtask = Subtask::new(
            SubtaskId::new(self.id)?,
            Capability::new(self.capability),
            self.command,
        )
        .with_params(self.params);
        for dep in self.depends_on {
            subtask = subtask.depends_on(SubtaskId::new(dep)?);
        }
        if !self.critical {
            subtask = subtask.non_critical();
        }
        Ok(subtask)
    }
}

async fn submit_task_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let subtasks = request
        .subtasks
        .into_iter()
        .map(SubtaskSpec::into_subtask)
        .collect::<Result<Vec<_>, _>>()?;
    let task_id = state.router.submit(request.goal, subtasks).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "task_id": task_id })),
    ))
}

async fn list_tasks_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tasks": state.router.list().await }))
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = TaskId::from_uuid(task_id);
    let status = state.router.status(&id).await.ok_or(TaskError::NotFound(id))?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

async fn cancel_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.router.cancel(TaskId::from_uuid(task_id)).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

// ---------------------------------------------------------------------------
// Locks

#[derive(Debug, Deserialize)]
struct AcquireLockRequest {
    resource_id: String,
    holder_id: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseLockRequest {
    token: Uuid,
}

async fn list_locks_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "locks": state.locks.list().await }))
}

async fn acquire_lock_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AcquireLockRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let token = state
        .locks
        .acquire(&request.resource_id, &request.holder_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "token": token })),
    ))
}

async fn release_lock_handler(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
    Json(request): Json<ReleaseLockRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .locks
        .release(&resource_id, LockToken(request.token))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn force_release_lock_handler(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.locks.force_release(&resource_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Transfers

#[derive(Debug, Deserialize)]
struct OpenTransferRequest {
    name: String,
    total_size: u64,
    checksum: String,
    source_id: String,
    target_id: String,
}

async fn list_transfers_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "transfers": state.transfers.list().await }))
}

async fn open_transfer_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenTransferRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let transfer_id = state
        .transfers
        .open(
            PayloadDescriptor {
                name: request.name,
                total_size: request.total_size,
                checksum: request.checksum,
            },
            &DeviceId::new(request.source_id),
            &DeviceId::new(request.target_id),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "transfer_id": transfer_id })),
    ))
}

async fn get_transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = TransferId::from_uuid(transfer_id);
    let status = state
        .transfers
        .status(&id)
        .await
        .ok_or(TransferError::NotFound(id))?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

/// Chunk bodies are raw bytes; the per-chunk checksum travels in the
/// `x-chunk-checksum` header.
async fn submit_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path((transfer_id, index)): Path<(Uuid, usize)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let checksum = headers
        .get("x-chunk-checksum")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing x-chunk-checksum header".to_string()))?;
    let resume_offset = state
        .transfers
        .submit_chunk(TransferId::from_uuid(transfer_id), index, body, checksum)
        .await?;
    Ok(Json(serde_json::json!({ "resume_offset": resume_offset })))
}

async fn resume_transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let offset = state.transfers.resume(TransferId::from_uuid(transfer_id)).await?;
    Ok(Json(serde_json::json!({ "resume_offset": offset })))
}

async fn complete_transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(transfer_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payload = state
        .transfers
        .complete(TransferId::from_uuid(transfer_id))
        .await?;
    Ok(Json(serde_json::json!({
        "complete": true,
        "bytes": payload.len(),
    })))
}

// ---------------------------------------------------------------------------
// Health targets

async fn health_targets_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "targets": state.health.status().await }))
}

async fn manual_probe_handler(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state.health.probe_now(&target).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}
