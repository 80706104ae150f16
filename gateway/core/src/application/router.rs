// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Task Router
//!
//! Drives a task's DAG to completion in waves: every subtask whose
//! dependencies are settled is dispatched concurrently (bounded by
//! `fan_out`), results are folded back into the graph, and the next wave
//! is derived from the updated graph. Each dispatch retries with
//! exponential backoff; a device that fails an attempt is excluded from
//! the next selection, so the retry lands elsewhere whenever another
//! capable device is online. When no device carries the capability at
//! all, a gateway-hosted provider can serve it instead.
//!
//! Duplicate responses (same `message_id`) are suppressed so a device
//! that answers twice cannot double-record a result. Late results for a
//! cancelled task are discarded.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::domain::config::RouterConfig;
use crate::domain::device::{Capability, Device, DeviceError, DeviceId};
use crate::domain::events::FleetEvent;
use crate::domain::message::{Envelope, MessageId, MessageType};
use crate::domain::provider::ProviderRegistry;
use crate::domain::task::{Subtask, SubtaskId, SubtaskState, Task, TaskError, TaskId, TaskState};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::transport::DeviceTransport;

use super::registry::DeviceRegistry;

/// Status view returned to the admin surface and CLI
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub goal: String,
    pub state: TaskState,
    pub subtasks: HashMap<SubtaskId, SubtaskState>,
    pub results: HashMap<SubtaskId, serde_json::Value>,
}

pub struct TaskRouter {
    tasks: RwLock<HashMap<TaskId, Task>>,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn DeviceTransport>,
    providers: Arc<ProviderRegistry>,
    config: RouterConfig,
    event_bus: Arc<EventBus>,
    /// Response message ids already folded into each task's graph;
    /// a task's entry is dropped once it is terminal.
    seen_responses: Mutex<HashMap<TaskId, HashSet<MessageId>>>,
    cancelled: RwLock<HashSet<TaskId>>,
    /// Live dispatches, kept so cancellation can notify the device
    in_flight: Mutex<HashMap<(TaskId, SubtaskId), DeviceId>>,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn DeviceTransport>,
        providers: Arc<ProviderRegistry>,
        config: RouterConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            registry,
            transport,
            providers,
            config,
            event_bus,
            seen_responses: Mutex::new(HashMap::new()),
            cancelled: RwLock::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and accept a task, then drive it in the background.
    pub async fn submit(
        self: &Arc<Self>,
        goal: impl Into<String>,
        subtasks: Vec<Subtask>,
    ) -> Result<TaskId, TaskError> {
        let task = Task::new(goal, subtasks, self.config.retry.clone())?;
        let task_id = task.id;

        info!(task_id = %task_id, goal = %task.goal, subtasks = task.subtask_count(), "Task submitted");
        self.event_bus.publish(FleetEvent::TaskSubmitted {
            task_id,
            goal: task.goal.clone(),
            at: Utc::now(),
        });

        self.tasks.write().await.insert(task_id, task);

        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.run(task_id).await;
        });
        Ok(task_id)
    }

    /// Cancel a running task: blocks every unfinished subtask and sends a
    /// best-effort cancel command to devices with work in flight.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), TaskError> {
        {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&task_id).ok_or(TaskError::NotFound(task_id))?;
            if task.state.is_terminal() {
                return Err(TaskError::AlreadyTerminal(task_id));
            }
            task.cancel();
        }
        self.cancelled.write().await.insert(task_id);
        warn!(task_id = %task_id, "Task cancelled");

        let live: Vec<(SubtaskId, DeviceId)> = {
            let in_flight = self.in_flight.lock().await;
            in_flight
                .iter()
                .filter(|((tid, _), _)| *tid == task_id)
                .map(|((_, sid), did)| (sid.clone(), did.clone()))
                .collect()
        };
        for (subtask_id, device_id) in live {
            let registry = Arc::clone(&self.registry);
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let Some(device) = registry.get(&device_id).await else {
                    return;
                };
                let envelope = Envelope::command(
                    DeviceId::gateway(),
                    device_id.clone(),
                    serde_json::json!({
                        "command": "cancel",
                        "task_id": task_id,
                        "subtask": subtask_id.as_str(),
                    }),
                );
                // Best effort only; the device may already be done
                if let Err(e) = transport.send(&device, &envelope).await {
                    debug!(device_id = %device_id, error = %e, "Cancel notification failed");
                }
            });
        }
        Ok(())
    }

    pub async fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).map(|task| TaskStatus {
            task_id: task.id,
            goal: task.goal.clone(),
            state: task.state,
            subtasks: task.breakdown(),
            results: task.results().clone(),
        })
    }

    pub async fn list(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<TaskStatus> = tasks
            .values()
            .map(|task| TaskStatus {
                task_id: task.id,
                goal: task.goal.clone(),
                state: task.state,
                subtasks: task.breakdown(),
                results: task.results().clone(),
            })
            .collect();
        all.sort_by_key(|s| s.task_id.0);
        all
    }

    /// Wave scheduler: dispatch the ready set concurrently, fold results,
    /// repeat until every subtask is terminal.
    async fn run(self: Arc<Self>, task_id: TaskId) {
        let limiter = Arc::new(Semaphore::new(self.config.fan_out));

        loop {
            if self.cancelled.read().await.contains(&task_id) {
                break;
            }

            let wave: Vec<SubtaskId> = {
                let mut tasks = self.tasks.write().await;
                let Some(task) = tasks.get_mut(&task_id) else {
                    return;
                };
                if task.all_terminal() {
                    break;
                }
                task.ready_set()
            };

            if wave.is_empty() {
                // Nothing ready and nothing terminal means the graph is
                // wedged; cancellation is the only path here.
                warn!(task_id = %task_id, "No dispatchable subtasks remain");
                break;
            }

            let handles: Vec<_> = wave
                .into_iter()
                .map(|subtask_id| {
                    let router = Arc::clone(&self);
                    let limiter = Arc::clone(&limiter);
                    tokio::spawn(async move {
                        let _permit = limiter.acquire_owned().await;
                        router.dispatch_subtask(task_id, subtask_id).await;
                    })
                })
                .collect();
            for handle in handles {
                let _ = handle.await;
            }
        }

        let final_state = {
            let tasks = self.tasks.read().await;
            tasks.get(&task_id).map(|t| t.state)
        };
        if let Some(state) = final_state {
            if state.is_terminal() {
                // The dedup ledger is only needed while dispatches can
                // still answer
                self.seen_responses.lock().await.remove(&task_id);
                info!(task_id = %task_id, state = ?state, "Task completed");
                self.event_bus.publish(FleetEvent::TaskCompleted {
                    task_id,
                    state,
                    at: Utc::now(),
                });
            }
        }
    }

    /// Select avoiding devices that already failed this subtask; when the
    /// exclusions empty the pool, fall back to the full pool so a lone
    /// device still gets the full attempt budget.
    async fn pick_device(
        &self,
        required: &BTreeSet<Capability>,
        failed: &HashSet<DeviceId>,
    ) -> Result<Device, DeviceError> {
        match self.registry.select_excluding(required, failed).await {
            Ok(device) => Ok(device),
            Err(_) if !failed.is_empty() => self.registry.select(required).await,
            Err(e) => Err(e),
        }
    }

    /// Drive one subtask through its attempt budget. Each attempt selects
    /// a device afresh, excluding the ones that already failed, so
    /// retries land elsewhere whenever possible.
    async fn dispatch_subtask(&self, task_id: TaskId, subtask_id: SubtaskId) {
        let (capability, command, params, policy) = {
            let tasks = self.tasks.read().await;
            let Some(subtask) = tasks.get(&task_id).and_then(|t| t.subtask(&subtask_id)) else {
                return;
            };
            let Some(task) = tasks.get(&task_id) else {
                return;
            };
            (
                subtask.capability.clone(),
                subtask.command.clone(),
                subtask.params.clone(),
                task.retry_policy.clone(),
            )
        };

        let required: BTreeSet<Capability> = [capability.clone()].into_iter().collect();
        let mut envelope: Option<(DeviceId, Envelope)> = None;
        let mut failed_devices: HashSet<DeviceId> = HashSet::new();
        let mut last_error = String::from("no attempt made");

        for attempt in 0..policy.max_attempts {
            if self.cancelled.read().await.contains(&task_id) {
                return;
            }
            if attempt > 0 {
                {
                    let mut tasks = self.tasks.write().await;
                    if let Some(task) = tasks.get_mut(&task_id) {
                        task.mark_retrying(&subtask_id);
                    }
                }
                tokio::time::sleep(policy.backoff(attempt - 1)).await;
            }

            let device = match self.pick_device(&required, &failed_devices).await {
                Ok(device) => device,
                Err(e) => {
                    // No device carries the capability; a gateway-hosted
                    // provider may still serve it.
                    if let Some(provider) = self.providers.resolve(&capability) {
                        match provider.execute(&command, &params).await {
                            Ok(value) => {
                                debug!(task_id = %task_id, subtask = %subtask_id, "Served by gateway provider");
                                {
                                    let mut tasks = self.tasks.write().await;
                                    if let Some(task) = tasks.get_mut(&task_id) {
                                        task.record_success(&subtask_id, value);
                                    }
                                }
                                self.event_bus.publish(FleetEvent::SubtaskSucceeded {
                                    task_id,
                                    subtask_id,
                                    at: Utc::now(),
                                });
                                return;
                            }
                            Err(pe) => {
                                warn!(task_id = %task_id, subtask = %subtask_id, error = %pe, "Gateway provider failed");
                                last_error = pe.to_string();
                                continue;
                            }
                        }
                    }
                    debug!(task_id = %task_id, subtask = %subtask_id, error = %e, "No device available");
                    last_error = e.to_string();
                    continue;
                }
            };

            // Re-sending to the same device keeps the message identity
            // (bumped retry_count); a different device gets a fresh
            // command addressed to it.
            let outgoing = match &envelope {
                Some((prev_target, prev)) if *prev_target == device.id => prev.retransmission(),
                _ => Envelope::command(
                    DeviceId::gateway(),
                    device.id.clone(),
                    serde_json::json!({
                        "command": command,
                        "params": params,
                        "task_id": task_id,
                        "subtask": subtask_id.as_str(),
                    }),
                ),
            };
            envelope = Some((device.id.clone(), outgoing.clone()));

            {
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&task_id) {
                    task.mark_dispatched(&subtask_id);
                }
            }
            self.in_flight
                .lock()
                .await
                .insert((task_id, subtask_id.clone()), device.id.clone());
            if let Some(correlation_id) = outgoing.correlation_id {
                self.event_bus.publish(FleetEvent::SubtaskDispatched {
                    task_id,
                    subtask_id: subtask_id.clone(),
                    device_id: device.id.clone(),
                    correlation_id,
                    attempt: attempt + 1,
                    at: Utc::now(),
                });
            }

            self.registry.adjust_load(&device.id, 1.0).await;
            let sent = tokio::time::timeout(
                self.config.dispatch_timeout,
                self.transport.send(&device, &outgoing),
            )
            .await;
            self.registry.adjust_load(&device.id, -1.0).await;
            self.in_flight
                .lock()
                .await
                .remove(&(task_id, subtask_id.clone()));

            let response = match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, subtask = %subtask_id, device = %device.id, error = %e, "Dispatch attempt failed");
                    last_error = e.to_string();
                    failed_devices.insert(device.id.clone());
                    continue;
                }
                Err(_) => {
                    warn!(task_id = %task_id, subtask = %subtask_id, device = %device.id, "Dispatch attempt timed out");
                    last_error = format!("dispatch to '{}' timed out", device.id);
                    failed_devices.insert(device.id.clone());
                    continue;
                }
            };

            // Suppress duplicate deliveries of the same response
            if !self
                .seen_responses
                .lock()
                .await
                .entry(task_id)
                .or_default()
                .insert(response.message_id)
            {
                warn!(message_id = %response.message_id, "Duplicate response discarded");
                last_error = "duplicate response".to_string();
                continue;
            }
            if self.cancelled.read().await.contains(&task_id) {
                debug!(task_id = %task_id, subtask = %subtask_id, "Late result discarded after cancellation");
                return;
            }

            match response.message_type {
                MessageType::Result => {
                    let mut tasks = self.tasks.write().await;
                    if let Some(task) = tasks.get_mut(&task_id) {
                        task.record_success(&subtask_id, response.payload);
                    }
                    self.event_bus.publish(FleetEvent::SubtaskSucceeded {
                        task_id,
                        subtask_id,
                        at: Utc::now(),
                    });
                    return;
                }
                MessageType::Error => {
                    let detail = response.payload["error"]
                        .as_str()
                        .unwrap_or("device error")
                        .to_string();
                    warn!(task_id = %task_id, subtask = %subtask_id, device = %device.id, error = %detail, "Device reported error");
                    last_error = detail;
                    continue;
                }
                other => {
                    warn!(task_id = %task_id, subtask = %subtask_id, message_type = %other, "Unexpected response type");
                    last_error = format!("unexpected response type '{}'", other);
                    continue;
                }
            }
        }

        // Retry budget exhausted
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&task_id) {
                task.record_failure(&subtask_id, &last_error);
            }
        }
        self.event_bus.publish(FleetEvent::SubtaskFailed {
            task_id,
            subtask_id,
            error: last_error,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::domain::config::HeartbeatConfig;
    use crate::domain::device::{Device, DeviceType};
    use crate::domain::task::RetryPolicy;
    use crate::infrastructure::transport::TransportError;
    use crate::application::registry::Registration;

    enum Script {
        /// Answer every command with a `result` echoing the payload
        Succeed,
        /// Fail with a transport error for the first `n` calls, then succeed
        FailThenSucceed(usize),
        /// Always fail with a transport error
        AlwaysFail,
        /// Refuse connections for one device, answer for every other
        RefuseDevice(&'static str),
        /// Always answer with the same message id
        FixedMessageId(MessageId),
        /// Sleep before answering
        Slow(Duration),
    }

    struct MockTransport {
        script: Script,
        calls: AtomicUsize,
        dispatched: std::sync::Mutex<Vec<String>>,
        /// (selected device, envelope target) per send
        routes: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
                dispatched: std::sync::Mutex::new(Vec::new()),
                routes: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn dispatch_order(&self) -> Vec<String> {
            self.dispatched.lock().unwrap().clone()
        }

        fn routes(&self) -> Vec<(String, String)> {
            self.routes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceTransport for MockTransport {
        async fn send(
            &self,
            device: &Device,
            envelope: &Envelope,
        ) -> Result<Envelope, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(subtask) = envelope.payload["subtask"].as_str() {
                self.dispatched.lock().unwrap().push(subtask.to_string());
            }
            self.routes
                .lock()
                .unwrap()
                .push((device.id.to_string(), envelope.target_id.to_string()));
            match &self.script {
                Script::Succeed => Ok(Envelope::result_for(
                    envelope,
                    serde_json::json!({ "echo": envelope.payload["command"] }),
                )),
                Script::FailThenSucceed(threshold) if n < *threshold => {
                    Err(TransportError::Unreachable {
                        device: device.id.to_string(),
                        detail: "connection refused".to_string(),
                    })
                }
                Script::FailThenSucceed(_) => {
                    Ok(Envelope::result_for(envelope, serde_json::json!({ "ok": true })))
                }
                Script::AlwaysFail => Err(TransportError::Unreachable {
                    device: device.id.to_string(),
                    detail: "connection refused".to_string(),
                }),
                Script::RefuseDevice(name) if device.id.as_str() == *name => {
                    Err(TransportError::Unreachable {
                        device: device.id.to_string(),
                        detail: "connection refused".to_string(),
                    })
                }
                Script::RefuseDevice(_) => Ok(Envelope::result_for(
                    envelope,
                    serde_json::json!({ "device": device.id.to_string() }),
                )),
                Script::FixedMessageId(id) => {
                    let mut response =
                        Envelope::result_for(envelope, serde_json::json!({ "ok": true }));
                    response.message_id = *id;
                    Ok(response)
                }
                Script::Slow(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Envelope::result_for(envelope, serde_json::json!({ "ok": true })))
                }
            }
        }
    }

    fn fast_config() -> RouterConfig {
        RouterConfig {
            fan_out: 8,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(4),
            },
            dispatch_timeout: Duration::from_secs(5),
        }
    }

    fn registry() -> (Arc<DeviceRegistry>, Arc<EventBus>) {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let registry = Arc::new(DeviceRegistry::new(
            HeartbeatConfig {
                interval: Duration::from_secs(10),
                degraded_after_misses: 3,
                offline_after_misses: 3,
                sweep_interval: Duration::from_secs(5),
            },
            Arc::clone(&event_bus),
        ));
        (registry, event_bus)
    }

    fn registration(id: &str, tags: &[&str]) -> Registration {
        Registration {
            device_id: DeviceId::new(id),
            device_type: DeviceType::Desktop,
            capabilities: tags.iter().map(|t| Capability::new(*t)).collect(),
            endpoint: format!("http://127.0.0.1:9100/{}", id),
        }
    }

    fn router_over(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn DeviceTransport>,
        providers: Arc<ProviderRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Arc<TaskRouter> {
        Arc::new(TaskRouter::new(
            registry,
            transport,
            providers,
            fast_config(),
            event_bus,
        ))
    }

    async fn fixture(transport: Arc<dyn DeviceTransport>) -> Arc<TaskRouter> {
        let (registry, event_bus) = registry();
        registry.register(registration("device-a", &["ocr", "ssh-exec"])).await;
        router_over(
            registry,
            transport,
            Arc::new(ProviderRegistry::new()),
            event_bus,
        )
    }

    fn sid(s: &str) -> SubtaskId {
        SubtaskId::new(s).unwrap()
    }

    async fn wait_terminal(router: &TaskRouter, task_id: TaskId) -> TaskStatus {
        for _ in 0..200 {
            if let Some(status) = router.status(&task_id).await {
                if status.state.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached a terminal state");
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_dependency_order() {
        let transport = MockTransport::new(Script::Succeed);
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("extract"), Capability::new("ocr"), "ocr_extract");
        let b = Subtask::new(sid("store"), Capability::new("ssh-exec"), "store_text")
            .depends_on(sid("extract"));
        let task_id = router.submit("digitize", vec![a, b]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.results.len(), 2);
        assert_eq!(transport.dispatch_order(), vec!["extract", "store"]);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let transport = MockTransport::new(Script::FailThenSucceed(2));
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("probe"), Capability::new("ocr"), "run");
        let task_id = router.submit("retry", vec![a]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_task_and_block_dependents() {
        let transport = MockTransport::new(Script::AlwaysFail);
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("a"), Capability::new("ocr"), "run");
        let b = Subtask::new(sid("b"), Capability::new("ocr"), "run").depends_on(sid("a"));
        let task_id = router.submit("doomed", vec![a, b]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.subtasks[&sid("b")], SubtaskState::Blocked);
        // Only the root ever dispatched, within its attempt budget
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades_to_partial() {
        let transport = MockTransport::new(Script::FailThenSucceed(3));
        let router = fixture(transport.clone()).await;

        // The first subtask burns all 3 attempts on failures; the
        // dependent then proceeds against its placeholder
        let a = Subtask::new(sid("enrich"), Capability::new("ocr"), "run").non_critical();
        let b = Subtask::new(sid("publish"), Capability::new("ocr"), "run")
            .depends_on(sid("enrich"));
        let task_id = router.submit("best-effort", vec![a, b]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::PartiallyFailed);
        assert_eq!(status.subtasks[&sid("publish")], SubtaskState::Succeeded);
        assert!(status.results[&sid("enrich")]["placeholder"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn test_no_capable_device_fails_after_retries() {
        let transport = MockTransport::new(Script::Succeed);
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("scan"), Capability::new("lidar"), "scan");
        let task_id = router.submit("unroutable", vec![a]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_responses_are_suppressed() {
        let fixed = MessageId::new();
        let transport = MockTransport::new(Script::FixedMessageId(fixed));
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("a"), Capability::new("ocr"), "run");
        let b = Subtask::new(sid("b"), Capability::new("ocr"), "run");
        let task_id = router.submit("dup", vec![a, b]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        // Exactly one subtask's response is accepted; the replayed
        // message id never records a second result
        assert_eq!(status.results.len(), 1);
        assert_eq!(status.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_discards_late_results() {
        let transport = MockTransport::new(Script::Slow(Duration::from_millis(100)));
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("long"), Capability::new("ocr"), "run");
        let task_id = router.submit("cancelme", vec![a]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        router.cancel(task_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = router.status(&task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.results.is_empty());

        // Cancelling a terminal task is rejected
        assert!(matches!(
            router.cancel(task_id).await,
            Err(TaskError::AlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_device_retried_elsewhere() {
        let transport = MockTransport::new(Script::RefuseDevice("dead"));
        let (registry, event_bus) = registry();
        registry.register(registration("dead", &["ocr"])).await;
        registry.register(registration("alive", &["ocr"])).await;
        // "dead" is the least loaded, so the first attempt goes there
        registry.adjust_load(&DeviceId::new("alive"), 0.5).await;
        let router = router_over(
            registry,
            transport.clone(),
            Arc::new(ProviderRegistry::new()),
            event_bus,
        );

        let a = Subtask::new(sid("scan"), Capability::new("ocr"), "run");
        let task_id = router.submit("route around", vec![a]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.results[&sid("scan")]["device"], "alive");

        // First attempt hit the refusing device, the retry moved on, and
        // every envelope was addressed to the device it was sent to
        let routes = transport.routes();
        assert_eq!(routes[0].0, "dead");
        assert!(routes.iter().any(|(device, _)| device == "alive"));
        assert!(routes.iter().all(|(device, target)| device == target));
    }

    #[tokio::test]
    async fn test_gateway_provider_serves_unrouted_capability() {
        use crate::domain::provider::{
            CapabilityProvider, HealthReport, ProviderError,
        };

        struct LocalOcr;

        #[async_trait]
        impl CapabilityProvider for LocalOcr {
            async fn execute(
                &self,
                command: &str,
                _params: &serde_json::Value,
            ) -> Result<serde_json::Value, ProviderError> {
                Ok(serde_json::json!({ "via": "gateway", "command": command }))
            }

            async fn health(&self) -> HealthReport {
                HealthReport::healthy()
            }
        }

        let transport = MockTransport::new(Script::Succeed);
        let (registry, event_bus) = registry();
        let mut providers = ProviderRegistry::new();
        providers.register(Capability::new("ocr"), Arc::new(LocalOcr));
        let router = router_over(
            registry,
            transport.clone(),
            Arc::new(providers),
            event_bus,
        );

        let a = Subtask::new(sid("scan"), Capability::new("ocr"), "ocr_extract");
        let task_id = router.submit("gateway-hosted", vec![a]).await.unwrap();

        let status = wait_terminal(&router, task_id).await;
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.results[&sid("scan")]["via"], "gateway");
        // No device dispatch happened
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_response_ledger_dropped_after_completion() {
        let transport = MockTransport::new(Script::Succeed);
        let router = fixture(transport.clone()).await;

        let a = Subtask::new(sid("a"), Capability::new("ocr"), "run");
        let task_id = router.submit("short-lived", vec![a]).await.unwrap();
        wait_terminal(&router, task_id).await;

        // The driving task prunes just after the state turns terminal
        for _ in 0..100 {
            if !router.seen_responses.lock().await.contains_key(&task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("response ledger still held after completion");
    }
}
