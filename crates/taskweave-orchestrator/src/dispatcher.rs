use crate::config::DispatchConfig;
use crate::registry::{AgentRegistry, AgentSnapshot};
use crate::scoring::{score, CapabilitySimilarity, ScoreBreakdown, ScoringWeights, TagSimilarity};
use crate::types::{DispatchDecision, DispatchStrategy, Task, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use taskweave_core::{AgentId, TaskweaveError, TaskweaveResult};
use tracing::{debug, info};
use uuid::Uuid;

/// Extra input for a single dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchHints {
    /// Agent to try last, typically the one that just failed this task.
    pub avoid: Option<AgentId>,
}

struct Ranked {
    snapshot: AgentSnapshot,
    breakdown: ScoreBreakdown,
}

/// Selects an agent for a ready task and reserves its capacity.
pub struct TaskDispatcher {
    registry: Arc<AgentRegistry>,
    weights: ScoringWeights,
    similarity: Arc<dyn CapabilitySimilarity>,
    /// Registration sequence of the agent last chosen by round robin.
    cursor: Mutex<Option<u64>>,
    history: Mutex<VecDeque<DispatchDecision>>,
    history_size: usize,
}

impl TaskDispatcher {
    /// Dispatcher over `registry` using the configured weights and similarity.
    pub fn new(registry: Arc<AgentRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            weights: config.weights,
            similarity: Arc::new(TagSimilarity::from_config(config)),
            cursor: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            history_size: config.history_size,
        }
    }

    /// Replace the capability similarity function.
    pub fn with_similarity(mut self, similarity: Arc<dyn CapabilitySimilarity>) -> Self {
        self.similarity = similarity;
        self
    }

    /// Registry this dispatcher reserves capacity in.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// [`dispatch_with`](Self::dispatch_with) without hints.
    pub fn dispatch(
        &self,
        task: &Task,
        strategy: DispatchStrategy,
    ) -> TaskweaveResult<DispatchDecision> {
        self.dispatch_with(task, strategy, &DispatchHints::default())
    }

    /// Pick an agent for `task` and reserve one unit of its capacity.
    ///
    /// Agents that handle the task type are preferred; when none is
    /// registered, any agent with free capacity is used and the decision is
    /// marked as a fallback. Losing a reservation race moves on to the next
    /// ranked agent.
    pub fn dispatch_with(
        &self,
        task: &Task,
        strategy: DispatchStrategy,
        hints: &DispatchHints,
    ) -> TaskweaveResult<DispatchDecision> {
        if task.status != TaskStatus::Ready {
            return Err(TaskweaveError::InvalidTaskState {
                task_id: task.id.clone(),
                expected: TaskStatus::Ready.to_string(),
                found: task.status.to_string(),
            });
        }

        let mut fallback = false;
        let mut pool: Vec<AgentSnapshot> = self.registry.candidates(&task.task_type).collect();
        if pool.is_empty() {
            fallback = true;
            pool = self.registry.all().collect();
        }

        let mut ranked: Vec<Ranked> = pool
            .into_iter()
            .filter(AgentSnapshot::has_capacity)
            .map(|snapshot| {
                let breakdown = score(task, &snapshot, &self.weights, self.similarity.as_ref());
                Ranked {
                    snapshot,
                    breakdown,
                }
            })
            .collect();

        if ranked.is_empty() {
            return Err(no_eligible(task));
        }

        self.rank(&mut ranked, strategy);
        if let Some(avoid) = hints.avoid.as_deref() {
            // Stable sort: only the avoided agent moves, to the back.
            ranked.sort_by_key(|r| r.snapshot.id() == avoid);
        }

        for candidate in ranked {
            let agent_id = candidate.snapshot.id();
            match self.registry.reserve(agent_id) {
                Ok(()) => {
                    let decision = self.decide(task, strategy, fallback, &candidate);
                    if strategy == DispatchStrategy::RoundRobin {
                        *self.cursor.lock() = Some(candidate.snapshot.sequence);
                    }
                    self.remember(decision.clone());
                    info!(
                        task_id = %task.id,
                        agent_id = %decision.agent_id,
                        strategy = %strategy,
                        confidence = decision.confidence,
                        fallback,
                        "Task dispatched"
                    );
                    return Ok(decision);
                }
                Err(TaskweaveError::CapacityExceeded { .. }) | Err(TaskweaveError::UnknownAgent(_)) => {
                    debug!(task_id = %task.id, agent_id, "Reservation lost, trying next agent");
                }
                Err(e) => return Err(e),
            }
        }

        Err(no_eligible(task))
    }

    fn rank(&self, ranked: &mut [Ranked], strategy: DispatchStrategy) {
        match strategy {
            DispatchStrategy::CapabilityMatch => ranked.sort_by(|a, b| {
                b.breakdown
                    .capability
                    .total_cmp(&a.breakdown.capability)
                    .then_with(|| tie_break(a, b))
            }),
            DispatchStrategy::LoadBalance => ranked.sort_by(|a, b| {
                a.snapshot
                    .utilisation()
                    .total_cmp(&b.snapshot.utilisation())
                    .then_with(|| b.snapshot.free_slots().cmp(&a.snapshot.free_slots()))
                    .then_with(|| tie_break(a, b))
            }),
            DispatchStrategy::PriorityFirst | DispatchStrategy::OptimalAssignment => {
                ranked.sort_by(tie_break)
            }
            DispatchStrategy::RoundRobin => {
                ranked.sort_by_key(|r| r.snapshot.sequence);
                if let Some(last) = *self.cursor.lock() {
                    let start = ranked
                        .iter()
                        .position(|r| r.snapshot.sequence > last)
                        .unwrap_or(0);
                    ranked.rotate_left(start);
                }
            }
        }
    }

    fn decide(
        &self,
        task: &Task,
        strategy: DispatchStrategy,
        fallback: bool,
        chosen: &Ranked,
    ) -> DispatchDecision {
        let confidence = if strategy.is_scored() {
            chosen.breakdown.total.clamp(0.0, 1.0)
        } else {
            1.0
        };
        DispatchDecision {
            id: Uuid::new_v4(),
            task_id: task.id.clone(),
            agent_id: chosen.snapshot.agent.id.clone(),
            confidence,
            score: chosen.breakdown.total,
            strategy,
            fallback,
            decided_at: Utc::now(),
        }
    }

    fn remember(&self, decision: DispatchDecision) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(decision);
    }

    /// Some registered agent could take `task` once its load drops.
    ///
    /// False when no agent with non-zero capacity matches the task type and
    /// none is available for the generic fallback either.
    pub fn could_serve(&self, task: &Task) -> bool {
        let mut candidates = self.registry.candidates(&task.task_type).peekable();
        if candidates.peek().is_some() {
            return candidates.any(|a| a.agent.capacity > 0);
        }
        self.registry.all().any(|a| a.agent.capacity > 0)
    }

    /// Most recent decisions, oldest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<DispatchDecision> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Suggest a strategy from the shape of a task set.
    pub fn recommend_strategy(tasks: &[Task], agent_count: usize) -> DispatchStrategy {
        if tasks.iter().any(|t| t.priority > 0) {
            DispatchStrategy::PriorityFirst
        } else if tasks.len() > agent_count.saturating_mul(2) {
            DispatchStrategy::LoadBalance
        } else if tasks.iter().any(|t| !t.dependencies.is_empty()) {
            DispatchStrategy::CapabilityMatch
        } else {
            DispatchStrategy::OptimalAssignment
        }
    }

    /// Order in which ready tasks are offered to the dispatcher.
    ///
    /// `PriorityFirst` sorts by descending priority, keeping planner order for
    /// equal priorities; every other strategy keeps planner order.
    pub fn order_ready(ready: &mut [&Task], strategy: DispatchStrategy) {
        if strategy == DispatchStrategy::PriorityFirst {
            ready.sort_by_key(|t| std::cmp::Reverse(t.priority));
        }
    }
}

/// Weighted score, then lowest load, then lowest id.
fn tie_break(a: &Ranked, b: &Ranked) -> Ordering {
    b.breakdown
        .total
        .total_cmp(&a.breakdown.total)
        .then_with(|| a.snapshot.utilisation().total_cmp(&b.snapshot.utilisation()))
        .then_with(|| a.snapshot.id().cmp(b.snapshot.id()))
}

fn no_eligible(task: &Task) -> TaskweaveError {
    TaskweaveError::NoEligibleAgent {
        task_id: task.id.clone(),
        task_type: task.task_type.clone(),
    }
}
