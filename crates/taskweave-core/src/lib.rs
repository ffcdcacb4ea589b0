//! Core types and error definitions for the Taskweave workflow engine.
//!
//! This crate provides the foundational pieces shared by every Taskweave
//! crate: the unified error enum and the identifier aliases used for tasks and
//! agents.
//!
//! # Main types
//!
//! - [`TaskweaveError`]: Unified error enum for all Taskweave subsystems.
//! - [`TaskweaveResult`]: Convenience alias for `Result<T, TaskweaveError>`.
//! - [`TaskId`] / [`AgentId`]: Planner- and operator-assigned identifiers.

/// Identifier of a task, unique within its workflow.
pub type TaskId = String;

/// Identifier of an execution agent, unique within a registry.
pub type AgentId = String;

// --- Error types ---

/// Top-level error type for the Taskweave engine.
///
/// The first six variants form the orchestration taxonomy; use
/// [`TaskweaveError::is_recoverable`] to decide whether an operation may be
/// retried.
#[derive(Debug, thiserror::Error)]
pub enum TaskweaveError {
    /// The task graph contains a dependency cycle. Fatal: the workflow never starts.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Task ids along the cycle, first id repeated at the end.
        cycle: Vec<TaskId>,
    },

    /// No registered agent can take the task right now.
    #[error("No eligible agent for task '{task_id}' of type '{task_type}'")]
    NoEligibleAgent {
        /// The task that could not be placed.
        task_id: TaskId,
        /// Its type tag.
        task_type: String,
    },

    /// The agent is already running as many tasks as it may.
    #[error("Agent '{agent_id}' is at capacity ({capacity})")]
    CapacityExceeded {
        /// The saturated agent.
        agent_id: AgentId,
        /// Its declared capacity.
        capacity: usize,
    },

    /// A task was asked to do something its current status does not allow.
    #[error("Invalid state for task '{task_id}': {found}, expected {expected}")]
    InvalidTaskState {
        /// The offending task.
        task_id: TaskId,
        /// The status the operation required.
        expected: String,
        /// The status the task actually had.
        found: String,
    },

    /// An executor reported failure, or the task ran past its timeout.
    #[error("Task '{task_id}' failed: {reason}")]
    TaskExecutionFailure {
        /// The failed task.
        task_id: TaskId,
        /// Executor-provided or engine-generated reason.
        reason: String,
    },

    /// An event handler returned an error or panicked.
    #[error("Event handler failed for '{event_type}': {reason}")]
    EventHandlerFailure {
        /// Type of the event being delivered.
        event_type: String,
        /// What went wrong.
        reason: String,
    },

    /// A workflow state transition that the state machine does not allow.
    #[error("Invalid workflow transition from {from} via {action}")]
    InvalidTransition {
        /// Current workflow status.
        from: String,
        /// Requested control action.
        action: String,
    },

    /// The planner produced an unusable task set (duplicate ids, unknown deps).
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `register` was called with an id that already exists.
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(AgentId),

    /// The agent still has active tasks.
    #[error("Agent '{agent_id}' still has {active} active task(s)")]
    AgentBusy {
        /// The busy agent.
        agent_id: AgentId,
        /// Its active task count.
        active: usize,
    },

    /// No agent with this id is registered.
    #[error("Unknown agent '{0}'")]
    UnknownAgent(AgentId),

    /// No workflow with this id exists.
    #[error("Unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// An operation did not finish within its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The event bus has been shut down.
    #[error("Event bus is closed")]
    BusClosed,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskweaveError {
    /// Whether the failure may succeed if the operation is attempted again.
    ///
    /// `NoEligibleAgent` and `CapacityExceeded` clear up as agents free capacity,
    /// and an executor failure is retried against the task's retry budget.
    /// Everything else is either fatal or a programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskweaveError::NoEligibleAgent { .. }
                | TaskweaveError::CapacityExceeded { .. }
                | TaskweaveError::TaskExecutionFailure { .. }
                | TaskweaveError::Timeout(_)
        )
    }
}

/// A convenience `Result` alias using [`TaskweaveError`].
pub type TaskweaveResult<T> = Result<T, TaskweaveError>;
