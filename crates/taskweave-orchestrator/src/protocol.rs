//! Payloads exchanged with executors over the event bus.
//!
//! The engine publishes a [`TaskAssignment`] as `task.dispatched`. An executor
//! may acknowledge it with `task.started` ([`TaskStarted`]) and must finally
//! publish `task.result` ([`TaskOutcome`]). All three carry the workflow id as
//! their correlation id.

use crate::types::DispatchDecision;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use taskweave_bus::{event_types, Event};
use taskweave_core::TaskId;
use uuid::Uuid;

/// Everything an executor needs to run a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Workflow the task belongs to.
    pub workflow_id: Uuid,
    /// Task to execute.
    pub task_id: TaskId,
    /// Task type, matched against agent capabilities.
    pub task_type: String,
    /// Agent choice; its id pairs results with this attempt.
    pub decision: DispatchDecision,
    /// Task parameters from the definition.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Task priority.
    pub priority: i32,
    /// 1 for the first dispatch, incremented on every retry.
    pub attempt: u32,
    /// Time the engine waits for the result before failing the attempt.
    pub timeout_ms: u64,
    /// Snapshot of the workflow's execution context.
    pub context: HashMap<String, serde_json::Value>,
    /// Results of the task's direct dependencies.
    pub dependency_results: HashMap<TaskId, serde_json::Value>,
}

impl TaskAssignment {
    /// Agent chosen for this attempt.
    pub fn agent_id(&self) -> &str {
        &self.decision.agent_id
    }

    /// Acknowledgement for this attempt.
    pub fn started(&self) -> TaskStarted {
        TaskStarted {
            workflow_id: self.workflow_id,
            task_id: self.task_id.clone(),
            decision_id: Some(self.decision.id),
        }
    }

    /// Successful outcome carrying `result`.
    pub fn succeeded(&self, result: serde_json::Value) -> TaskOutcome {
        TaskOutcome {
            workflow_id: self.workflow_id,
            task_id: self.task_id.clone(),
            decision_id: Some(self.decision.id),
            success: true,
            result: Some(result),
            error: None,
            latency_ms: 0,
            context_updates: HashMap::new(),
        }
    }

    /// Failed outcome carrying `error`.
    pub fn failed(&self, error: impl Into<String>) -> TaskOutcome {
        TaskOutcome {
            workflow_id: self.workflow_id,
            task_id: self.task_id.clone(),
            decision_id: Some(self.decision.id),
            success: false,
            result: None,
            error: Some(error.into()),
            latency_ms: 0,
            context_updates: HashMap::new(),
        }
    }
}

/// `task.started` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStarted {
    /// Workflow the task belongs to.
    pub workflow_id: Uuid,
    /// Task that started.
    pub task_id: TaskId,
    /// Attempt that started, when known.
    #[serde(default)]
    pub decision_id: Option<Uuid>,
}

impl TaskStarted {
    /// Wrap as a `task.started` event.
    pub fn into_event(self, source: impl Into<String>) -> Event {
        let correlation = self.workflow_id.to_string();
        Event::new(event_types::TASK_STARTED, source, to_payload(&self)).with_correlation(correlation)
    }
}

/// `task.result` payload.
///
/// Without a `decision_id` the outcome applies to whatever attempt of the task
/// is currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Workflow the task belongs to.
    pub workflow_id: Uuid,
    /// Task that finished.
    pub task_id: TaskId,
    /// Attempt that finished. `None` means the current one.
    #[serde(default)]
    pub decision_id: Option<Uuid>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Task result on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Execution time reported by the executor. Zero means unmeasured.
    #[serde(default)]
    pub latency_ms: u64,
    /// Merged into the workflow's execution context on success.
    #[serde(default)]
    pub context_updates: HashMap<String, serde_json::Value>,
}

impl TaskOutcome {
    /// Record the measured execution time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Merge `key = value` into the execution context on success.
    pub fn with_context_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    /// Wrap as a `task.result` event.
    pub fn into_event(self, source: impl Into<String>) -> Event {
        let correlation = self.workflow_id.to_string();
        Event::new(event_types::TASK_RESULT, source, to_payload(&self)).with_correlation(correlation)
    }
}

fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    // Plain structs with string keys always serialize.
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
