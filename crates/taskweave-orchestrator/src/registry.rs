use crate::config::RegistryConfig;
use crate::types::Agent;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskweave_core::{AgentId, TaskweaveError, TaskweaveResult};
use tracing::{debug, info, warn};

/// Moving averages of an agent's results for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Outcomes observed so far.
    pub samples: u64,
    /// In `[0, 1]`.
    pub success_rate: f64,
    /// Moving average latency in milliseconds.
    pub mean_latency_ms: f64,
}

impl PerformanceStats {
    fn observe(&mut self, alpha: f64, success: bool, latency_ms: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        if self.samples == 0 {
            self.success_rate = outcome;
            self.mean_latency_ms = latency_ms;
        } else {
            self.success_rate = alpha * outcome + (1.0 - alpha) * self.success_rate;
            self.mean_latency_ms = alpha * latency_ms + (1.0 - alpha) * self.mean_latency_ms;
        }
        self.samples += 1;
    }
}

/// Point-in-time copy of an agent and its registry-owned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Agent as registered.
    pub agent: Agent,
    /// Registration order; earlier agents have smaller numbers.
    pub sequence: u64,
    /// Reserved capacity units.
    pub active_tasks: usize,
    /// Performance keyed by task type.
    pub stats: HashMap<String, PerformanceStats>,
}

impl AgentSnapshot {
    /// Agent id.
    pub fn id(&self) -> &str {
        &self.agent.id
    }

    /// Capacity units still available.
    pub fn free_slots(&self) -> usize {
        self.agent.capacity.saturating_sub(self.active_tasks)
    }

    /// At least one free slot.
    pub fn has_capacity(&self) -> bool {
        self.free_slots() > 0
    }

    /// Fraction of capacity in use, `[0, 1]`.
    pub fn utilisation(&self) -> f64 {
        if self.agent.capacity == 0 {
            return 1.0;
        }
        self.active_tasks as f64 / self.agent.capacity as f64
    }

    /// Stats for `task_type`, if any outcome was recorded.
    pub fn performance(&self, task_type: &str) -> Option<&PerformanceStats> {
        self.stats.get(task_type)
    }
}

struct AgentRecord {
    agent: Agent,
    sequence: u64,
    active: usize,
    stats: HashMap<String, PerformanceStats>,
}

impl AgentRecord {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent: self.agent.clone(),
            sequence: self.sequence,
            active_tasks: self.active,
            stats: self.stats.clone(),
        }
    }
}

type RecordRef = Arc<Mutex<AgentRecord>>;

#[derive(Default)]
struct Directory {
    order: Vec<RecordRef>,
    by_id: HashMap<AgentId, RecordRef>,
    next_sequence: u64,
}

/// Lazy iterator over registered agents, in registration order.
///
/// A clone is an independent iterator at the same position; calling
/// [`AgentRegistry::candidates`] again starts over. Each snapshot is taken when
/// the iterator reaches that agent.
#[derive(Clone)]
pub struct Candidates {
    records: Vec<RecordRef>,
    task_type: Option<String>,
    position: usize,
}

impl Iterator for Candidates {
    type Item = AgentSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(record) = self.records.get(self.position) {
            self.position += 1;
            let record = record.lock();
            let matches = self
                .task_type
                .as_deref()
                .map_or(true, |t| record.agent.handles(t));
            if matches {
                return Some(record.snapshot());
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.records.len() - self.position.min(self.records.len())))
    }
}

/// Directory of execution agents with their load and performance.
///
/// Each agent has its own lock; the directory lock is only held to look a
/// record up or to change membership.
pub struct AgentRegistry {
    directory: RwLock<Directory>,
    alpha: f64,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            alpha: config.ewma_alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Add a new agent. Fails on a duplicate id or a zero capacity.
    pub fn register(&self, agent: Agent) -> TaskweaveResult<()> {
        validate(&agent)?;
        let mut dir = self.directory.write();
        if dir.by_id.contains_key(&agent.id) {
            return Err(TaskweaveError::DuplicateAgent(agent.id));
        }
        Self::insert(&mut dir, agent);
        Ok(())
    }

    /// Add an agent, or replace the declared fields of an existing one.
    ///
    /// A replaced agent keeps its registration position, active count and
    /// statistics. Lowering capacity below the active count is refused.
    pub fn register_or_replace(&self, agent: Agent) -> TaskweaveResult<()> {
        validate(&agent)?;
        let mut dir = self.directory.write();
        let Some(existing) = dir.by_id.get(&agent.id).cloned() else {
            Self::insert(&mut dir, agent);
            return Ok(());
        };

        let mut record = existing.lock();
        if agent.capacity < record.active {
            return Err(TaskweaveError::CapacityExceeded {
                agent_id: agent.id,
                capacity: agent.capacity,
            });
        }
        info!(agent_id = %agent.id, capacity = agent.capacity, "Agent replaced");
        record.agent = agent;
        Ok(())
    }

    fn insert(dir: &mut Directory, agent: Agent) {
        let sequence = dir.next_sequence;
        dir.next_sequence += 1;
        info!(agent_id = %agent.id, capacity = agent.capacity, "Agent registered");
        let record = Arc::new(Mutex::new(AgentRecord {
            agent,
            sequence,
            active: 0,
            stats: HashMap::new(),
        }));
        let id = record.lock().agent.id.clone();
        dir.order.push(record.clone());
        dir.by_id.insert(id, record);
    }

    /// Remove an idle agent. Returns `false` if no such agent exists.
    pub fn unregister(&self, agent_id: &str) -> TaskweaveResult<bool> {
        let mut dir = self.directory.write();
        let Some(record) = dir.by_id.get(agent_id).cloned() else {
            return Ok(false);
        };
        let active = record.lock().active;
        if active > 0 {
            return Err(TaskweaveError::AgentBusy {
                agent_id: agent_id.to_string(),
                active,
            });
        }
        dir.by_id.remove(agent_id);
        dir.order.retain(|r| !Arc::ptr_eq(r, &record));
        info!(agent_id, "Agent unregistered");
        Ok(true)
    }

    /// Agents whose capabilities or preferences contain `task_type`.
    pub fn candidates(&self, task_type: &str) -> Candidates {
        Candidates {
            records: self.directory.read().order.clone(),
            task_type: Some(task_type.to_string()),
            position: 0,
        }
    }

    /// Every registered agent.
    pub fn all(&self) -> Candidates {
        Candidates {
            records: self.directory.read().order.clone(),
            task_type: None,
            position: 0,
        }
    }

    /// Snapshot of one agent.
    pub fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let record = self.directory.read().by_id.get(agent_id).cloned()?;
        let snapshot = record.lock().snapshot();
        Some(snapshot)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.directory.read().order.len()
    }

    /// No agents registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, agent_id: &str) -> TaskweaveResult<RecordRef> {
        self.directory
            .read()
            .by_id
            .get(agent_id)
            .cloned()
            .ok_or_else(|| TaskweaveError::UnknownAgent(agent_id.to_string()))
    }

    /// Take one unit of the agent's capacity.
    pub fn reserve(&self, agent_id: &str) -> TaskweaveResult<()> {
        let record = self.record(agent_id)?;
        let mut record = record.lock();
        if record.active >= record.agent.capacity {
            return Err(TaskweaveError::CapacityExceeded {
                agent_id: agent_id.to_string(),
                capacity: record.agent.capacity,
            });
        }
        record.active += 1;
        debug!(agent_id, active = record.active, "Capacity reserved");
        Ok(())
    }

    /// Return one unit of capacity. Releasing an idle agent is a no-op.
    pub fn release(&self, agent_id: &str) -> TaskweaveResult<()> {
        let record = self.record(agent_id)?;
        let mut record = record.lock();
        if record.active == 0 {
            warn!(agent_id, "Release on an agent with no active tasks");
            return Ok(());
        }
        record.active -= 1;
        debug!(agent_id, active = record.active, "Capacity released");
        Ok(())
    }

    /// Fold one task outcome into the agent's moving averages.
    pub fn record_outcome(
        &self,
        agent_id: &str,
        task_type: &str,
        success: bool,
        latency: Duration,
    ) -> TaskweaveResult<()> {
        let record = self.record(agent_id)?;
        let mut record = record.lock();
        let stats = record.stats.entry(task_type.to_string()).or_default();
        stats.observe(self.alpha, success, latency.as_secs_f64() * 1_000.0);
        debug!(
            agent_id,
            task_type,
            success,
            success_rate = stats.success_rate,
            "Outcome recorded"
        );
        Ok(())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn validate(agent: &Agent) -> TaskweaveResult<()> {
    if agent.id.trim().is_empty() {
        return Err(TaskweaveError::InvalidArgument(
            "agent id must not be empty".into(),
        ));
    }
    if agent.capacity == 0 {
        return Err(TaskweaveError::InvalidArgument(format!(
            "agent '{}' must have a capacity of at least 1",
            agent.id
        )));
    }
    Ok(())
}
