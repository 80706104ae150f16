// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for Fleet Events
//
// In-memory event streaming using tokio broadcast channels. Feeds the
// CLI status stream and any observer interested in fleet lifecycle
// (device liveness, task progress, lock reaps, transfer completion).

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::FleetEvent;
use crate::domain::task::TaskId;

/// Event bus for publishing and subscribing to fleet events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FleetEvent>>,
}

impl EventBus {
    /// Create a new event bus; capacity bounds how many events buffer
    /// before slow receivers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: FleetEvent) {
        debug!("Publishing event: {:?}", event);
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all fleet events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe filtered to a single task's lifecycle
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver {
            receiver: self.sender.subscribe(),
            task_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<FleetEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<FleetEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one task's events
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    pub async fn recv(&mut self) -> Result<FleetEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &FleetEvent) -> bool {
        match event {
            FleetEvent::TaskSubmitted { task_id, .. }
            | FleetEvent::SubtaskDispatched { task_id, .. }
            | FleetEvent::SubtaskSucceeded { task_id, .. }
            | FleetEvent::SubtaskFailed { task_id, .. }
            | FleetEvent::TaskCompleted { task_id, .. } => *task_id == self.task_id,
            _ => false,
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::domain::device::DeviceId;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.publish(FleetEvent::DeviceRegistered {
            device_id: DeviceId::new("device-a"),
            at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            FleetEvent::DeviceRegistered { device_id, .. } => {
                assert_eq!(device_id, DeviceId::new("device-a"));
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_filtering() {
        let bus = EventBus::new(10);
        let task_id = TaskId::new();
        let other = TaskId::new();
        let mut receiver = bus.subscribe_task(task_id);

        bus.publish(FleetEvent::TaskSubmitted {
            task_id: other,
            goal: "ignored".to_string(),
            at: Utc::now(),
        });
        bus.publish(FleetEvent::TaskSubmitted {
            task_id,
            goal: "mine".to_string(),
            at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            FleetEvent::TaskSubmitted { task_id: id, goal, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(goal, "mine");
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(FleetEvent::DeviceDeregistered {
            device_id: DeviceId::new("gone"),
            at: Utc::now(),
        });

        r1.recv().await.unwrap();
        r2.recv().await.unwrap();
    }
}
