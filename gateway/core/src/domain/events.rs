// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Domain Events
//!
//! Published on the in-process event bus for the CLI and any status
//! streaming consumers. Serialized with a `type` tag for wire friendliness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::device::{DeviceId, DeviceStatus};
use crate::domain::message::CorrelationId;
use crate::domain::task::{SubtaskId, TaskId, TaskState};
use crate::domain::transfer::TransferId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    DeviceRegistered {
        device_id: DeviceId,
        at: DateTime<Utc>,
    },
    DeviceStatusChanged {
        device_id: DeviceId,
        from: DeviceStatus,
        to: DeviceStatus,
        at: DateTime<Utc>,
    },
    DeviceDeregistered {
        device_id: DeviceId,
        at: DateTime<Utc>,
    },
    TaskSubmitted {
        task_id: TaskId,
        goal: String,
        at: DateTime<Utc>,
    },
    SubtaskDispatched {
        task_id: TaskId,
        subtask_id: SubtaskId,
        device_id: DeviceId,
        correlation_id: CorrelationId,
        attempt: u32,
        at: DateTime<Utc>,
    },
    SubtaskSucceeded {
        task_id: TaskId,
        subtask_id: SubtaskId,
        at: DateTime<Utc>,
    },
    SubtaskFailed {
        task_id: TaskId,
        subtask_id: SubtaskId,
        error: String,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        state: TaskState,
        at: DateTime<Utc>,
    },
    LockReaped {
        resource_id: String,
        holder_id: String,
        age_seconds: u64,
        at: DateTime<Utc>,
    },
    TransferCompleted {
        transfer_id: TransferId,
        total_size: u64,
        at: DateTime<Utc>,
    },
    ProbeFailed {
        target: String,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    RestartTriggered {
        target: String,
        at: DateTime<Utc>,
    },
    TargetEscalated {
        target: String,
        at: DateTime<Utc>,
    },
}
