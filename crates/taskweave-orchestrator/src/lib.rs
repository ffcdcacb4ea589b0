//! Agent registry, task dispatcher and workflow state machine.
//!
//! A [`WorkflowEngine`] plans a [`WorkflowDefinition`] into a validated
//! [`TaskGraph`], assigns every ready task to the best-suited agent through the
//! [`TaskDispatcher`], hands the assignment to executors over the event bus and
//! composes the results once every task has completed.
//!
//! # Main types
//!
//! - [`WorkflowEngine`]: Drives workflows from planning to composition.
//! - [`AgentRegistry`]: Agents with their capacity, load and performance.
//! - [`TaskDispatcher`]: Strategy-driven agent selection and reservation.
//! - [`TaskGraph`]: Dependency-checked task set with validated transitions.
//! - [`OrchestrationContext`]: The bus and registry shared by an engine.
//! - [`OrchestratorConfig`]: TOML-loadable configuration for all of the above.

/// Configuration structs with serde defaults.
pub mod config;
/// Shared services passed to the engine.
pub mod context;
/// Planner and composer seams.
pub mod contracts;
/// Agent selection.
pub mod dispatcher;
/// Workflow driver and control surface.
pub mod engine;
/// Executor-facing event payloads.
pub mod protocol;
/// Agent directory, load and performance tracking.
pub mod registry;
/// Suitability scoring and capability similarity.
pub mod scoring;
/// Validated task set and task transitions.
pub mod task_graph;
/// Tasks, agents, decisions and statuses.
pub mod types;
/// Workflow definitions, execution context and reports.
pub mod workflow;

pub use config::{DispatchConfig, EngineConfig, OrchestratorConfig, RegistryConfig, RetryPolicy};
pub use context::OrchestrationContext;
pub use contracts::{
    CollectingComposer, Composer, CompositionInput, DefinitionPlanner, Planner,
};
pub use dispatcher::{DispatchHints, TaskDispatcher};
pub use engine::WorkflowEngine;
pub use protocol::{TaskAssignment, TaskOutcome, TaskStarted};
pub use registry::{AgentRegistry, AgentSnapshot, Candidates, PerformanceStats};
pub use scoring::{score, CapabilitySimilarity, ScoreBreakdown, ScoringWeights, TagSimilarity};
pub use task_graph::{TaskCounts, TaskGraph};
pub use types::{
    Agent, DispatchDecision, DispatchStrategy, Phase, Task, TaskStatus, WorkflowStatus,
};
pub use workflow::{
    ExecutionContext, TaskReport, WorkflowDefinition, WorkflowReport, WorkflowSummary,
};
