use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use taskweave_core::TaskweaveResult;
use uuid::Uuid;

/// Well-known event type tags.
///
/// Lifecycle events are emitted by the orchestrator for observers and storage
/// layers; `TASK_STARTED` and `TASK_RESULT` are published by executors.
pub mod event_types {
    /// A workflow passed planning and started running.
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    /// A workflow was paused by its operator.
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    /// A paused workflow was resumed.
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    /// Every task completed and the composer produced the artifact.
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    /// The workflow failed; the payload carries the reason.
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    /// The workflow was cancelled.
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";

    /// All dependencies of a task completed.
    pub const TASK_READY: &str = "task.ready";
    /// A task was bound to an agent. Executors subscribe to this.
    pub const TASK_DISPATCHED: &str = "task.dispatched";
    /// The executor acknowledged the task and began work.
    pub const TASK_RUNNING: &str = "task.running";
    /// A task finished successfully.
    pub const TASK_COMPLETED: &str = "task.completed";
    /// A failed task is being put back in the ready set.
    pub const TASK_RETRYING: &str = "task.retrying";
    /// A task failed for good.
    pub const TASK_FAILED: &str = "task.failed";
    /// A task was cancelled before finishing.
    pub const TASK_CANCELLED: &str = "task.cancelled";
    /// A task exceeded its execution budget.
    pub const TASK_TIMED_OUT: &str = "task.timed_out";

    /// Executor → core: work on a dispatched task began.
    pub const TASK_STARTED: &str = "task.started";
    /// Executor → core: a dispatched task finished, successfully or not.
    pub const TASK_RESULT: &str = "task.result";

    /// A subscriber returned an error, panicked, or timed out.
    pub const HANDLER_FAILED: &str = "bus.handler_failed";

    /// Subscribes to every event type.
    pub const WILDCARD: &str = "*";
}

/// Priority level attached to an event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Background information.
    Low,
    /// Regular lifecycle events.
    #[default]
    Normal,
    /// Failures and timeouts.
    High,
    /// Needs immediate attention.
    Critical,
}

/// An immutable message travelling over the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: Uuid,
    /// Type tag used for subscription matching.
    pub event_type: String,
    /// Urgency of the event.
    pub priority: EventPriority,
    /// Component that produced the event, e.g. `workflow.<id>`.
    pub source: String,
    /// Event-specific data.
    pub payload: serde_json::Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Links the event to a workflow (or task) for routing and tracing.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Event {
    /// Creates an event with [`EventPriority::Normal`] and no correlation id.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            priority: EventPriority::Normal,
            source: source.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Tie the event to a workflow or task.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Deserializes the payload into a typed record.
    pub fn payload_as<T: DeserializeOwned>(&self) -> TaskweaveResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Whether this event is one of the bus's own failure notices.
    pub fn is_failure_notice(&self) -> bool {
        self.event_type == event_types::HANDLER_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_event_defaults() {
        let event = Event::new("task.result", "executor.a", serde_json::json!({}));
        assert_eq!(event.priority, EventPriority::Normal);
        assert!(event.correlation_id.is_none());
        assert!(!event.is_failure_notice());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Payload {
            task_id: String,
        }
        let event = Event::new("x", "y", serde_json::json!({ "task_id": "t1" }))
            .with_correlation("wf-1");
        let payload: Payload = event.payload_as().unwrap();
        assert_eq!(payload.task_id, "t1");
        assert_eq!(event.correlation_id.as_deref(), Some("wf-1"));
    }

    #[test]
    fn test_payload_as_mismatch() {
        let event = Event::new("x", "y", serde_json::json!([1, 2]));
        let parsed: TaskweaveResult<std::collections::HashMap<String, u32>> = event.payload_as();
        assert!(parsed.is_err());
    }
}
