use crate::types::{Task, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskweave_core::{AgentId, TaskId, TaskweaveError, TaskweaveResult};

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Waiting on dependencies.
    pub pending: usize,
    /// Eligible for dispatch.
    pub ready: usize,
    /// Handed to an agent.
    pub dispatched: usize,
    /// Acknowledged by the executor.
    pub running: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Failed with the retry budget spent.
    pub failed: usize,
    /// Cancelled.
    pub cancelled: usize,
}

/// The validated task set of one workflow, in planner order.
///
/// Every status change goes through this type so that transitions are checked
/// and recorded in [`Task::history`].
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    completed: HashSet<TaskId>,
}

impl TaskGraph {
    /// Validate a planned task set.
    ///
    /// Rejects empty or duplicate ids and dependencies on unknown tasks with
    /// `InvalidDefinition`, and dependency cycles with `CyclicDependency`.
    pub fn build(tasks: Vec<Task>) -> TaskweaveResult<Self> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(TaskweaveError::InvalidDefinition(format!(
                    "task at position {pos} has an empty id"
                )));
            }
            if index.insert(task.id.clone(), pos).is_some() {
                return Err(TaskweaveError::InvalidDefinition(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }
        for task in &tasks {
            if let Some(dep) = task.dependencies.iter().find(|d| !index.contains_key(*d)) {
                return Err(TaskweaveError::InvalidDefinition(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
        }

        let mut graph = Self {
            tasks,
            index,
            completed: HashSet::new(),
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(TaskweaveError::CyclicDependency { cycle });
        }

        for task in &mut graph.tasks {
            task.status = TaskStatus::Pending;
            task.history = vec![TaskStatus::Pending];
        }
        Ok(graph)
    }

    /// Three-colour DFS along dependency edges, in planner order.
    /// Returns the ids along the first cycle found, closing id repeated.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited: HashMap<usize, u8> = HashMap::new();
        let mut path = Vec::new();
        for pos in 0..self.tasks.len() {
            if let Some(cycle) = self.dfs_cycle(pos, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        pos: usize,
        visited: &mut HashMap<usize, u8>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<TaskId>> {
        match visited.get(&pos) {
            Some(1) => {
                // Back edge: the cycle is the path suffix starting at `pos`.
                let start = path.iter().position(|p| *p == pos).unwrap_or(0);
                let mut cycle: Vec<TaskId> = path[start..]
                    .iter()
                    .map(|p| self.tasks[*p].id.clone())
                    .collect();
                cycle.push(self.tasks[pos].id.clone());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }
        visited.insert(pos, 1);
        path.push(pos);
        for dep in &self.tasks[pos].dependencies {
            if let Some(&next) = self.index.get(dep) {
                if let Some(cycle) = self.dfs_cycle(next, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        visited.insert(pos, 2);
        None
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// No tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|pos| &self.tasks[*pos])
    }

    /// All tasks in planner order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn task_mut(&mut self, id: &str) -> TaskweaveResult<&mut Task> {
        let pos = *self
            .index
            .get(id)
            .ok_or_else(|| TaskweaveError::InvalidArgument(format!("unknown task '{id}'")))?;
        Ok(&mut self.tasks[pos])
    }

    /// Move a task to `next`, recording the change.
    pub fn transition(&mut self, id: &str, next: TaskStatus) -> TaskweaveResult<()> {
        let task = self.task_mut(id)?;
        if !task.status.can_transition_to(next) {
            return Err(TaskweaveError::InvalidTaskState {
                task_id: task.id.clone(),
                expected: format!("a status that can become {next}"),
                found: task.status.to_string(),
            });
        }
        task.status = next;
        task.history.push(next);
        task.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Promote every pending task whose dependencies all completed.
    /// Returns the promoted ids in planner order.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.is_ready(&self.completed))
            .map(|t| t.id.clone())
            .collect();
        for id in &ready {
            // Pending -> Ready is always allowed.
            let _ = self.transition(id, TaskStatus::Ready);
        }
        ready
    }

    /// READY to DISPATCHED, counting the attempt.
    pub fn mark_dispatched(&mut self, id: &str, agent_id: &str) -> TaskweaveResult<()> {
        self.transition(id, TaskStatus::Dispatched)?;
        let task = self.task_mut(id)?;
        task.attempts += 1;
        task.assigned_agent = Some(agent_id.to_string());
        Ok(())
    }

    /// DISPATCHED to RUNNING.
    pub fn mark_running(&mut self, id: &str) -> TaskweaveResult<()> {
        self.transition(id, TaskStatus::Running)
    }

    /// Record the result and move to COMPLETED.
    pub fn mark_completed(&mut self, id: &str, result: serde_json::Value) -> TaskweaveResult<()> {
        self.transition(id, TaskStatus::Completed)?;
        let task = self.task_mut(id)?;
        task.result = Some(result);
        self.completed.insert(id.to_string());
        Ok(())
    }

    /// Record a failed attempt. Returns the agent the task was bound to.
    pub fn mark_failed(&mut self, id: &str, reason: &str) -> TaskweaveResult<Option<AgentId>> {
        self.transition(id, TaskStatus::Failed)?;
        let task = self.task_mut(id)?;
        task.last_error = Some(reason.to_string());
        Ok(task.assigned_agent.take())
    }

    /// Put a failed task back in the ready set, spending one retry.
    pub fn mark_retry(&mut self, id: &str) -> TaskweaveResult<()> {
        self.transition(id, TaskStatus::Ready)?;
        let task = self.task_mut(id)?;
        task.retries_used += 1;
        Ok(())
    }

    /// Freeze the last error of a failed task as its final error.
    pub fn conclude_failure(&mut self, id: &str) -> TaskweaveResult<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Failed {
            return Err(TaskweaveError::InvalidTaskState {
                task_id: task.id.clone(),
                expected: TaskStatus::Failed.to_string(),
                found: task.status.to_string(),
            });
        }
        task.error = task.last_error.clone();
        Ok(())
    }

    /// Cancel every task that has not finished.
    ///
    /// Returns `(task_id, agent)` for each cancelled task; `agent` is set for
    /// tasks that held a reservation.
    pub fn cancel_unfinished(&mut self) -> Vec<(TaskId, Option<AgentId>)> {
        let open: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status.can_transition_to(TaskStatus::Cancelled))
            .map(|t| t.id.clone())
            .collect();
        let mut cancelled = Vec::with_capacity(open.len());
        for id in open {
            if self.transition(&id, TaskStatus::Cancelled).is_err() {
                continue;
            }
            let agent = self.task_mut(&id).ok().and_then(|t| t.assigned_agent.take());
            cancelled.push((id, agent));
        }
        cancelled
    }

    /// Tasks in READY.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.with_status(TaskStatus::Ready)
    }

    /// Tasks in DISPATCHED or RUNNING.
    pub fn in_flight(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .collect()
    }

    /// Tasks with `status`.
    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    /// Every task COMPLETED. True for an empty graph.
    pub fn all_completed(&self) -> bool {
        self.completed.len() == self.tasks.len()
    }

    /// Tasks per status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Dispatched => counts.dispatched += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Results of every completed task, keyed by id.
    pub fn results(&self) -> HashMap<TaskId, serde_json::Value> {
        self.tasks
            .iter()
            .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
            .collect()
    }

    /// Results of the direct dependencies of `id`.
    pub fn dependency_results(&self, id: &str) -> HashMap<TaskId, serde_json::Value> {
        let Some(task) = self.get(id) else {
            return HashMap::new();
        };
        task.dependencies
            .iter()
            .filter_map(|dep| {
                self.get(dep)
                    .and_then(|d| d.result.clone())
                    .map(|r| (dep.clone(), r))
            })
            .collect()
    }
}
