//! Seams for the collaborators that turn objectives into tasks and task
//! results into a final artifact.

use crate::types::Task;
use crate::workflow::WorkflowDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskweave_core::{TaskId, TaskweaveResult};
use uuid::Uuid;

/// Produces the task set of a workflow.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce the task set for `definition`. Returned tasks are validated afterwards.
    async fn plan(&self, definition: &WorkflowDefinition) -> TaskweaveResult<Vec<Task>>;
}

/// Uses the tasks listed in the definition as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionPlanner;

#[async_trait]
impl Planner for DefinitionPlanner {
    async fn plan(&self, definition: &WorkflowDefinition) -> TaskweaveResult<Vec<Task>> {
        Ok(definition.tasks.clone())
    }
}

/// What the composer receives once every task has completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionInput {
    /// Workflow being composed.
    pub workflow_id: Uuid,
    /// Workflow name.
    pub name: String,
    /// Task results in planner order.
    pub results: Vec<(TaskId, serde_json::Value)>,
    /// Execution context at the end of the run.
    pub context: HashMap<String, serde_json::Value>,
}

/// Builds the final artifact of a workflow.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Build the workflow artifact from the completed tasks.
    async fn compose(&self, input: CompositionInput) -> TaskweaveResult<serde_json::Value>;
}

/// Returns a JSON object mapping each task id to its result.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectingComposer;

#[async_trait]
impl Composer for CollectingComposer {
    async fn compose(&self, input: CompositionInput) -> TaskweaveResult<serde_json::Value> {
        let map: serde_json::Map<String, serde_json::Value> = input.results.into_iter().collect();
        Ok(serde_json::Value::Object(map))
    }
}
