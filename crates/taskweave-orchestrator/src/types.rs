use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use taskweave_core::{AgentId, TaskId};
use uuid::Uuid;

/// Status of a task inside its workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies met, waiting for an agent.
    Ready,
    /// Assigned, not yet acknowledged.
    Dispatched,
    /// Acknowledged by the executor.
    Running,
    /// Finished with a result.
    Completed,
    /// Attempt failed.
    Failed,
    /// Will not run.
    Cancelled,
}

impl TaskStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Failed -> Ready` is the retry edge; `Ready -> Failed` is taken when the
    /// dispatch budget runs out before any agent accepted the task.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready) => true,
            (Ready, Dispatched) | (Ready, Failed) => true,
            (Dispatched, Running) | (Dispatched, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Failed, Ready) => true,
            (Pending | Ready | Dispatched | Running, Cancelled) => true,
            _ => false,
        }
    }

    /// Bound to an agent and holding one unit of its capacity.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// A unit of work produced by the planner.
///
/// Tasks are plain records. Every status change goes through
/// [`TaskGraph`](crate::task_graph::TaskGraph), which owns the transition rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the workflow.
    pub id: TaskId,
    /// Kind of work, matched against agent capabilities.
    #[serde(alias = "type")]
    pub task_type: String,
    /// Tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    /// Executor input.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Additional capability tags the agent should declare.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Agent category this task would rather run on.
    #[serde(default)]
    pub preferred_category: Option<String>,
    /// Overrides the engine's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the engine's default execution timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Result of the successful attempt.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Final error, set once when the task fails for good.
    #[serde(default)]
    pub error: Option<String>,
    /// Error of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Number of times the task has been dispatched.
    #[serde(default)]
    pub attempts: u32,
    /// Retries consumed from the budget.
    #[serde(default)]
    pub retries_used: u32,
    /// Agent of the current or last attempt.
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    /// Every status the task has held, oldest first.
    #[serde(default)]
    pub history: Vec<TaskStatus>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Time of the last transition.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Task with no dependencies and default settings.
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            dependencies: Vec::new(),
            priority: 0,
            parameters: HashMap::new(),
            required_capabilities: Vec::new(),
            preferred_category: None,
            max_retries: None,
            timeout_ms: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            last_error: None,
            attempts: 0,
            retries_used: 0,
            assigned_agent: None,
            history: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Set the dependency ids.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority. Higher runs first under `priority_first`.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add one parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Capability tags required beyond the task type.
    pub fn with_required_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Prefer agents of this category.
    pub fn with_preferred_category(mut self, category: impl Into<String>) -> Self {
        self.preferred_category = Some(category.into());
        self
    }

    /// Override the engine's default retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the engine's execution timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Pending with every dependency completed.
    pub fn is_ready(&self, completed: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// Declared properties of an execution agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: AgentId,
    /// Free-form agent kind (e.g. `"llm"`, `"crawler"`), matched against
    /// [`Task::preferred_category`].
    #[serde(default)]
    pub category: Option<String>,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Task types this agent would rather take, most preferred first.
    #[serde(default)]
    pub preferences: Vec<String>,
    /// Maximum number of concurrently assigned tasks.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_capacity() -> usize {
    1
}

impl Agent {
    /// Agent with no capabilities.
    pub fn new(id: impl Into<AgentId>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            category: None,
            capabilities: BTreeSet::new(),
            preferences: Vec::new(),
            capacity,
            metadata: HashMap::new(),
        }
    }

    /// Add capability tags.
    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the preferred task types.
    pub fn with_preferences<I, S>(mut self, task_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferences = task_types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Declares the tag as a capability or lists it as a preference.
    pub fn handles(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type) || self.preferences.iter().any(|p| p == task_type)
    }
}

/// Algorithm used to pick an agent for a ready task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Highest capability factor wins.
    CapabilityMatch,
    /// Least utilised agent wins.
    LoadBalance,
    /// Ready tasks are dispatched by descending priority; agents by weighted score.
    PriorityFirst,
    /// Eligible agents in registration order, one after another.
    RoundRobin,
    /// Full weighted score.
    #[default]
    OptimalAssignment,
}

impl DispatchStrategy {
    /// Strategies whose decision confidence is the weighted score.
    pub fn is_scored(self) -> bool {
        !matches!(
            self,
            DispatchStrategy::LoadBalance | DispatchStrategy::RoundRobin
        )
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DispatchStrategy::CapabilityMatch => "capability_match",
            DispatchStrategy::LoadBalance => "load_balance",
            DispatchStrategy::PriorityFirst => "priority_first",
            DispatchStrategy::RoundRobin => "round_robin",
            DispatchStrategy::OptimalAssignment => "optimal_assignment",
        };
        write!(f, "{label}")
    }
}

/// The binding of one task to one agent. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchDecision {
    /// Decision id, echoed by executors.
    pub id: Uuid,
    /// Task assigned.
    pub task_id: TaskId,
    /// Agent chosen.
    pub agent_id: AgentId,
    /// In `[0, 1]`; the weighted score for scored strategies, otherwise 1.0.
    pub confidence: f64,
    /// Weighted suitability of the chosen agent at decision time.
    pub score: f64,
    /// Strategy used.
    pub strategy: DispatchStrategy,
    /// The agent came from the generic fallback set rather than a type match.
    pub fallback: bool,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Submitted, planning in progress.
    #[default]
    Pending,
    /// Dispatching and executing tasks.
    Running,
    /// No new dispatches.
    Paused,
    /// Artifact composed.
    Completed,
    /// Stopped by a planning, task or composition failure.
    Failed {
        reason: String,
    },
    /// Stopped by request.
    Cancelled {
        reason: String,
    },
}

impl WorkflowStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed { .. }
                | WorkflowStatus::Cancelled { .. }
        )
    }

    /// Human-readable reason attached to failed and cancelled workflows.
    pub fn reason(&self) -> Option<&str> {
        match self {
            WorkflowStatus::Failed { reason } | WorkflowStatus::Cancelled { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }

    /// Lowercase name of the status.
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed { .. } => "failed",
            WorkflowStatus::Cancelled { .. } => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.label()),
            None => write!(f, "{}", self.label()),
        }
    }
}

/// Phase a running workflow is currently in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Planner running and graph validation.
    #[default]
    Planning,
    /// Offering ready tasks to agents.
    Dispatch,
    /// Waiting on executors.
    Execution,
    /// Composer running.
    Composition,
}
