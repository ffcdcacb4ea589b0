use crate::task_graph::TaskCounts;
use crate::types::{DispatchDecision, DispatchStrategy, Phase, Task, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use taskweave_core::{AgentId, TaskId, TaskweaveError, TaskweaveResult};
use uuid::Uuid;

/// What a caller submits: a named objective plus the tasks (or the inputs a
/// planner needs to produce them).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Display name.
    pub name: String,
    /// Free-text goal, available to custom planners.
    #[serde(default)]
    pub objective: Option<String>,
    /// Overrides the engine's strategy selection for this workflow.
    #[serde(default)]
    pub strategy: Option<DispatchStrategy>,
    /// Initial contents of the execution context.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Tasks in the workflow.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl WorkflowDefinition {
    /// Empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a task.
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Add several tasks.
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Pin the dispatch strategy.
    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Seed one context variable.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Parse a TOML definition.
    pub fn from_toml_str(raw: &str) -> TaskweaveResult<Self> {
        toml::from_str(raw).map_err(|e| TaskweaveError::Config(e.to_string()))
    }

    /// Read a TOML definition from disk.
    pub fn load(path: impl AsRef<Path>) -> TaskweaveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TaskweaveError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Scratch space shared by the tasks of one workflow.
///
/// Executors read a snapshot from each `task.dispatched` event and may return
/// updates with their result; updates are merged in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    variables: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Context seeded with `variables`.
    pub fn new(variables: HashMap<String, serde_json::Value>) -> Self {
        Self { variables }
    }

    /// Variable by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    /// Set one variable.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(key.into(), value);
    }

    /// Overwrite with every entry of `updates`.
    pub fn merge(&mut self, updates: HashMap<String, serde_json::Value>) {
        self.variables.extend(updates);
    }

    /// Copy of all variables.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.variables.clone()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// No variables.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Per-task line of a [`WorkflowReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task id.
    pub id: TaskId,
    /// Task type.
    pub task_type: String,
    /// Final or current status.
    pub status: crate::types::TaskStatus,
    /// Dispatches so far.
    pub attempts: u32,
    /// Retries consumed.
    pub retries_used: u32,
    /// Agent of the last attempt.
    pub assigned_agent: Option<AgentId>,
    /// Final error, if failed.
    pub error: Option<String>,
    /// Every status the task passed through.
    pub history: Vec<crate::types::TaskStatus>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            task_type: task.task_type.clone(),
            status: task.status,
            attempts: task.attempts,
            retries_used: task.retries_used,
            assigned_agent: task.assigned_agent.clone(),
            error: task.error.clone(),
            history: task.history.clone(),
        }
    }
}

/// Read-only view of a workflow for callers and storage layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Workflow id.
    pub id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Current phase.
    pub phase: Phase,
    /// Dispatch strategy in use.
    pub strategy: DispatchStrategy,
    /// Tasks per status.
    pub counts: TaskCounts,
    /// Per-task detail.
    pub tasks: Vec<TaskReport>,
    /// Every dispatch decision taken for this workflow, oldest first.
    pub decisions: Vec<DispatchDecision>,
    /// Results of completed tasks; kept when the workflow fails.
    pub results: HashMap<TaskId, serde_json::Value>,
    /// Execution context.
    pub context: HashMap<String, serde_json::Value>,
    /// Composed artifact, once completed.
    pub artifact: Option<serde_json::Value>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When dispatch began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowReport {
    /// Failure or cancellation reason.
    pub fn reason(&self) -> Option<&str> {
        self.status.reason()
    }
}

/// One line of [`WorkflowEngine::list`](crate::engine::WorkflowEngine::list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow id.
    pub id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
}
