use crate::config::{EngineConfig, OrchestratorConfig};
use crate::context::OrchestrationContext;
use crate::contracts::{CollectingComposer, Composer, CompositionInput, DefinitionPlanner, Planner};
use crate::dispatcher::{DispatchHints, TaskDispatcher};
use crate::protocol::{TaskAssignment, TaskOutcome, TaskStarted};
use crate::task_graph::TaskGraph;
use crate::types::{DispatchDecision, DispatchStrategy, Phase, TaskStatus, WorkflowStatus};
use crate::workflow::{ExecutionContext, TaskReport, WorkflowDefinition, WorkflowReport, WorkflowSummary};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskweave_bus::{event_types, Event, EventPriority, SubscriptionHandle};
use taskweave_core::{AgentId, TaskId, TaskweaveError, TaskweaveResult};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Priority of the engine's own `task.started` / `task.result` handlers.
const ROUTING_PRIORITY: i32 = 1_000;

enum Signal {
    Started(TaskStarted),
    Outcome(TaskOutcome),
    /// Re-evaluate after an external state change (resume, cancel).
    Wake,
}

type Routes = Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<Signal>>>>;

/// A dispatched attempt the engine is waiting on.
struct InFlight {
    decision_id: Uuid,
    agent_id: AgentId,
    task_type: String,
    dispatched_at: Instant,
    deadline: Instant,
}

/// Events produced under the workflow lock, published once it is released.
struct Outbox {
    workflow_id: Uuid,
    events: Vec<Event>,
}

impl Outbox {
    fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            events: Vec::new(),
        }
    }

    fn push(&mut self, event_type: &str, payload: serde_json::Value) {
        self.push_with(event_type, EventPriority::Normal, payload);
    }

    fn push_with(&mut self, event_type: &str, priority: EventPriority, payload: serde_json::Value) {
        let event = Event::new(event_type, format!("workflow.{}", self.workflow_id), payload)
            .with_priority(priority)
            .with_correlation(self.workflow_id.to_string());
        self.events.push(event);
    }
}

struct WorkflowState {
    id: Uuid,
    name: String,
    status: WorkflowStatus,
    phase: Phase,
    strategy: DispatchStrategy,
    graph: TaskGraph,
    context: ExecutionContext,
    decisions: Vec<DispatchDecision>,
    in_flight: HashMap<TaskId, InFlight>,
    /// Earliest time a ready task may be offered to the dispatcher again.
    not_before: HashMap<TaskId, Instant>,
    /// Consecutive dispatch attempts that found no agent.
    dispatch_failures: HashMap<TaskId, u32>,
    /// Agent that failed the task's previous attempt.
    avoid: HashMap<TaskId, AgentId>,
    artifact: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    fn pending(id: Uuid, definition: &WorkflowDefinition, strategy: DispatchStrategy) -> Self {
        Self {
            id,
            name: definition.name.clone(),
            status: WorkflowStatus::Pending,
            phase: Phase::Planning,
            strategy: definition.strategy.unwrap_or(strategy),
            graph: TaskGraph::default(),
            context: ExecutionContext::new(definition.context.clone()),
            decisions: Vec::new(),
            in_flight: HashMap::new(),
            not_before: HashMap::new(),
            dispatch_failures: HashMap::new(),
            avoid: HashMap::new(),
            artifact: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn report(&self) -> WorkflowReport {
        WorkflowReport {
            id: self.id,
            name: self.name.clone(),
            status: self.status.clone(),
            phase: self.phase,
            strategy: self.strategy,
            counts: self.graph.counts(),
            tasks: self.graph.tasks().iter().map(TaskReport::from).collect(),
            decisions: self.decisions.clone(),
            results: self.graph.results(),
            context: self.context.snapshot(),
            artifact: self.artifact.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

struct WorkflowHandle {
    id: Uuid,
    name: String,
    state: Mutex<WorkflowState>,
    status: watch::Sender<WorkflowStatus>,
    signals: Option<mpsc::UnboundedSender<Signal>>,
}

impl WorkflowHandle {
    fn wake(&self) {
        if let Some(signals) = &self.signals {
            let _ = signals.send(Signal::Wake);
        }
    }
}

struct EngineInner {
    ctx: OrchestrationContext,
    dispatcher: TaskDispatcher,
    config: EngineConfig,
    planner: Arc<dyn Planner>,
    composer: Arc<dyn Composer>,
    workflows: RwLock<HashMap<Uuid, Arc<WorkflowHandle>>>,
    routes: Routes,
    subscriptions: Vec<SubscriptionHandle>,
}

/// Drives workflows from planning to composition.
///
/// Each submitted workflow gets its own driver task that reacts to executor
/// events and deadlines; all task state changes happen under that workflow's
/// lock. Events are published after the lock is released.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine using the definition's own tasks and a collecting composer.
    pub fn new(ctx: OrchestrationContext, config: &OrchestratorConfig) -> TaskweaveResult<Self> {
        Self::with_contracts(
            ctx,
            config,
            Arc::new(DefinitionPlanner),
            Arc::new(CollectingComposer),
        )
    }

    /// Create with a custom planner and composer.
    pub fn with_contracts(
        ctx: OrchestrationContext,
        config: &OrchestratorConfig,
        planner: Arc<dyn Planner>,
        composer: Arc<dyn Composer>,
    ) -> TaskweaveResult<Self> {
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let mut subscriptions = Vec::with_capacity(2);

        let started_routes = routes.clone();
        subscriptions.push(ctx.bus.subscribe(
            event_types::TASK_STARTED,
            ROUTING_PRIORITY,
            move |event| {
                let started: TaskStarted = event.payload_as()?;
                route(&started_routes, started.workflow_id, Signal::Started(started));
                Ok(())
            },
        )?);

        let outcome_routes = routes.clone();
        subscriptions.push(ctx.bus.subscribe(
            event_types::TASK_RESULT,
            ROUTING_PRIORITY,
            move |event| {
                let outcome: TaskOutcome = event.payload_as()?;
                route(&outcome_routes, outcome.workflow_id, Signal::Outcome(outcome));
                Ok(())
            },
        )?);

        let dispatcher = TaskDispatcher::new(ctx.registry.clone(), &config.dispatch);
        Ok(Self {
            inner: Arc::new(EngineInner {
                ctx,
                dispatcher,
                config: config.engine.clone(),
                planner,
                composer,
                workflows: RwLock::new(HashMap::new()),
                routes,
                subscriptions,
            }),
        })
    }

    /// The bus and registry this engine works against.
    pub fn context(&self) -> &OrchestrationContext {
        &self.inner.ctx
    }

    /// The dispatcher shared by every workflow of this engine.
    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.inner.dispatcher
    }

    /// Plan and validate a workflow, then start driving it.
    ///
    /// The workflow is listed as `Pending` while the planner runs and may be
    /// cancelled then; it becomes `Running` once its task graph is validated.
    /// A workflow rejected during planning is recorded as failed and
    /// `workflow.failed` is published; the planning error is returned.
    pub async fn submit(&self, definition: WorkflowDefinition) -> TaskweaveResult<Uuid> {
        let id = Uuid::new_v4();
        info!(workflow_id = %id, name = %definition.name, "Workflow submitted");

        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(WorkflowStatus::Pending);
        let handle = Arc::new(WorkflowHandle {
            id,
            name: definition.name.clone(),
            state: Mutex::new(WorkflowState::pending(
                id,
                &definition,
                self.inner.config.default_strategy,
            )),
            status,
            signals: Some(tx.clone()),
        });
        self.inner.workflows.write().insert(id, handle.clone());

        let planned = match self.inner.planner.plan(&definition).await {
            Ok(tasks) => TaskGraph::build(tasks),
            Err(e) => Err(e),
        };
        let graph = match planned {
            Ok(graph) => graph,
            Err(e) => {
                self.reject(&handle, &e).await;
                return Err(e);
            }
        };

        let strategy = definition.strategy.unwrap_or_else(|| {
            if self.inner.config.auto_select_strategy {
                TaskDispatcher::recommend_strategy(graph.tasks(), self.inner.ctx.registry.len())
            } else {
                self.inner.config.default_strategy
            }
        });
        let task_count = graph.len();

        let mut outbox = Outbox::new(id);
        {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                info!(workflow_id = %id, status = %state.status, "Workflow ended during planning");
                return Ok(id);
            }
            state.status = WorkflowStatus::Running;
            state.phase = Phase::Dispatch;
            state.strategy = strategy;
            state.graph = graph;
            state.started_at = Some(Utc::now());
            handle.status.send_replace(WorkflowStatus::Running);
            outbox.push(
                event_types::WORKFLOW_STARTED,
                serde_json::json!({
                    "workflow_id": id,
                    "name": definition.name,
                    "strategy": strategy,
                    "tasks": task_count,
                }),
            );
        }
        self.inner.routes.write().insert(id, tx);
        self.publish(outbox).await;
        info!(workflow_id = %id, strategy = %strategy, tasks = task_count, "Workflow started");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drive(handle, rx).await;
        });
        Ok(id)
    }

    async fn reject(&self, handle: &WorkflowHandle, err: &TaskweaveError) {
        let reason = err.to_string();
        let mut outbox = Outbox::new(handle.id);
        {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return;
            }
            warn!(workflow_id = %handle.id, error = %err, "Workflow rejected during planning");
            state.status = WorkflowStatus::Failed {
                reason: reason.clone(),
            };
            state.finished_at = Some(Utc::now());
            handle.status.send_replace(state.status.clone());
            outbox.push_with(
                event_types::WORKFLOW_FAILED,
                EventPriority::High,
                serde_json::json!({ "workflow_id": handle.id, "phase": Phase::Planning, "reason": reason }),
            );
        }
        self.publish(outbox).await;
    }

    fn handle(&self, id: Uuid) -> TaskweaveResult<Arc<WorkflowHandle>> {
        self.inner
            .workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TaskweaveError::UnknownWorkflow(id.to_string()))
    }

    /// Current status without taking the workflow lock.
    pub fn status(&self, id: Uuid) -> TaskweaveResult<WorkflowStatus> {
        let handle = self.handle(id)?;
        let status = handle.status.borrow().clone();
        Ok(status)
    }

    /// Snapshot of the workflow's tasks, decisions, results and context.
    pub async fn report(&self, id: Uuid) -> TaskweaveResult<WorkflowReport> {
        let handle = self.handle(id)?;
        let state = handle.state.lock().await;
        Ok(state.report())
    }

    /// Every known workflow, ordered by id.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let workflows = self.inner.workflows.read();
        let mut summaries: Vec<WorkflowSummary> = workflows
            .values()
            .map(|h| WorkflowSummary {
                id: h.id,
                name: h.name.clone(),
                status: h.status.borrow().clone(),
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Wait until the workflow reaches a terminal status.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> TaskweaveResult<WorkflowStatus> {
        let handle = self.handle(id)?;
        let mut rx = handle.status.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            match rx.wait_for(WorkflowStatus::is_terminal).await {
                Ok(status) => (*status).clone(),
                Err(_) => handle.status.borrow().clone(),
            }
        })
        .await;
        waited.map_err(|_| {
            TaskweaveError::Timeout(format!(
                "workflow {id} still {} after {}ms",
                handle.status.borrow().label(),
                timeout.as_millis()
            ))
        })
    }

    /// Stop dispatching new tasks. In-flight results are still applied.
    pub async fn pause(&self, id: Uuid) -> TaskweaveResult<()> {
        let handle = self.handle(id)?;
        let mut outbox = Outbox::new(id);
        {
            let mut state = handle.state.lock().await;
            if state.status != WorkflowStatus::Running {
                return Err(TaskweaveError::InvalidTransition {
                    from: state.status.label().to_string(),
                    action: "pause".into(),
                });
            }
            state.status = WorkflowStatus::Paused;
            handle.status.send_replace(WorkflowStatus::Paused);
            outbox.push(
                event_types::WORKFLOW_PAUSED,
                serde_json::json!({ "workflow_id": id }),
            );
        }
        info!(workflow_id = %id, "Workflow paused");
        self.publish(outbox).await;
        Ok(())
    }

    /// Restart dispatch of a paused workflow.
    pub async fn resume(&self, id: Uuid) -> TaskweaveResult<()> {
        let handle = self.handle(id)?;
        let mut outbox = Outbox::new(id);
        {
            let mut state = handle.state.lock().await;
            if state.status != WorkflowStatus::Paused {
                return Err(TaskweaveError::InvalidTransition {
                    from: state.status.label().to_string(),
                    action: "resume".into(),
                });
            }
            state.status = WorkflowStatus::Running;
            handle.status.send_replace(WorkflowStatus::Running);
            outbox.push(
                event_types::WORKFLOW_RESUMED,
                serde_json::json!({ "workflow_id": id }),
            );
        }
        info!(workflow_id = %id, "Workflow resumed");
        self.publish(outbox).await;
        handle.wake();
        Ok(())
    }

    /// Cancel a workflow, releasing every reservation it holds.
    ///
    /// Cancelling a finished workflow changes nothing and returns its status.
    pub async fn cancel(&self, id: Uuid) -> TaskweaveResult<WorkflowStatus> {
        let handle = self.handle(id)?;
        let mut outbox = Outbox::new(id);
        let status = {
            let mut state = handle.state.lock().await;
            if state.status.is_terminal() {
                return Ok(state.status.clone());
            }
            let reason = "cancelled by request".to_string();
            self.inner.cancel_open_tasks(&mut state, &mut outbox);
            state.status = WorkflowStatus::Cancelled {
                reason: reason.clone(),
            };
            state.finished_at = Some(Utc::now());
            handle.status.send_replace(state.status.clone());
            outbox.push(
                event_types::WORKFLOW_CANCELLED,
                serde_json::json!({ "workflow_id": id, "reason": reason }),
            );
            state.status.clone()
        };
        info!(workflow_id = %id, "Workflow cancelled");
        self.publish(outbox).await;
        handle.wake();
        Ok(status)
    }

    async fn publish(&self, outbox: Outbox) {
        self.inner.publish(outbox).await;
    }

    /// Remove the engine's bus subscriptions. Running drivers stop receiving
    /// executor events.
    pub fn detach(&self) {
        for handle in &self.inner.subscriptions {
            self.inner.ctx.bus.unsubscribe(handle);
        }
    }
}

fn route(routes: &Routes, workflow_id: Uuid, signal: Signal) {
    match routes.read().get(&workflow_id) {
        Some(tx) => {
            if tx.send(signal).is_err() {
                debug!(workflow_id = %workflow_id, "Driver gone, executor event dropped");
            }
        }
        None => debug!(workflow_id = %workflow_id, "Executor event for unknown workflow"),
    }
}

/// What the driver should do after a step.
enum Next {
    /// Sleep until a signal arrives or the deadline passes.
    Wait(Option<Instant>),
    Compose(CompositionInput),
    Finished,
}

impl EngineInner {
    async fn publish(&self, outbox: Outbox) {
        for event in outbox.events {
            let event_type = event.event_type.clone();
            if let Err(e) = self.ctx.bus.publish(event).await {
                warn!(
                    workflow_id = %outbox.workflow_id,
                    event_type = %event_type,
                    error = %e,
                    "Failed to publish workflow event"
                );
            }
        }
    }

    async fn drive(self: Arc<Self>, handle: Arc<WorkflowHandle>, mut rx: mpsc::UnboundedReceiver<Signal>) {
        let id = handle.id;
        let mut pending: Vec<Signal> = Vec::new();
        loop {
            let mut outbox = Outbox::new(id);
            let next = {
                let mut state = handle.state.lock().await;
                while let Ok(signal) = rx.try_recv() {
                    pending.push(signal);
                }
                let next = self.step(&mut state, pending.drain(..), &mut outbox);
                handle.status.send_if_modified(|current| {
                    if *current != state.status {
                        *current = state.status.clone();
                        true
                    } else {
                        false
                    }
                });
                next
            };
            self.publish(outbox).await;

            match next {
                Next::Finished => break,
                Next::Compose(input) => {
                    let outcome = self.composer.compose(input).await;
                    let mut outbox = Outbox::new(id);
                    {
                        let mut state = handle.state.lock().await;
                        self.finish_composition(&mut state, outcome, &mut outbox);
                        handle.status.send_replace(state.status.clone());
                    }
                    self.publish(outbox).await;
                    break;
                }
                Next::Wait(deadline) => {
                    let signal = match deadline {
                        Some(at) => tokio::select! {
                            signal = rx.recv() => signal.map(Some),
                            _ = tokio::time::sleep_until(at) => Some(None),
                        },
                        None => rx.recv().await.map(Some),
                    };
                    match signal {
                        Some(Some(signal)) => pending.push(signal),
                        Some(None) => {}
                        None => break,
                    }
                }
            }
        }
        self.routes.write().remove(&id);
        debug!(workflow_id = %id, "Workflow driver stopped");
    }

    /// One reaction of the driver, under the workflow lock.
    fn step(
        &self,
        state: &mut WorkflowState,
        signals: impl Iterator<Item = Signal>,
        outbox: &mut Outbox,
    ) -> Next {
        for signal in signals {
            if state.status.is_terminal() {
                break;
            }
            match signal {
                Signal::Started(started) => self.apply_started(state, started, outbox),
                Signal::Outcome(outcome) => self.apply_outcome(state, outcome, outbox),
                Signal::Wake => {}
            }
        }
        if state.status.is_terminal() {
            return Next::Finished;
        }

        self.expire_timeouts(state, outbox);
        if state.status.is_terminal() {
            return Next::Finished;
        }

        for task_id in state.graph.promote_ready() {
            debug!(workflow_id = %state.id, task_id = %task_id, "Task ready");
            outbox.push(
                event_types::TASK_READY,
                serde_json::json!({ "workflow_id": state.id, "task_id": task_id }),
            );
        }

        if state.status == WorkflowStatus::Running {
            self.dispatch_ready(state, outbox);
            if state.status.is_terminal() {
                return Next::Finished;
            }
            if state.graph.all_completed() {
                state.phase = Phase::Composition;
                info!(workflow_id = %state.id, "All tasks completed, composing");
                return Next::Compose(CompositionInput {
                    workflow_id: state.id,
                    name: state.name.clone(),
                    results: state
                        .graph
                        .tasks()
                        .iter()
                        .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
                        .collect(),
                    context: state.context.snapshot(),
                });
            }
        }

        Next::Wait(self.next_deadline(state))
    }

    fn next_deadline(&self, state: &WorkflowState) -> Option<Instant> {
        let timeouts = state.in_flight.values().map(|f| f.deadline);
        let backoffs = state
            .graph
            .ready_tasks()
            .into_iter()
            .filter_map(|t| state.not_before.get(&t.id).copied());
        if state.status == WorkflowStatus::Running {
            timeouts.chain(backoffs).min()
        } else {
            timeouts.min()
        }
    }

    fn apply_started(&self, state: &mut WorkflowState, started: TaskStarted, outbox: &mut Outbox) {
        if !is_current(state, &started.task_id, started.decision_id) {
            debug!(workflow_id = %state.id, task_id = %started.task_id, "Stale task.started ignored");
            return;
        }
        if state
            .graph
            .get(&started.task_id)
            .is_some_and(|t| t.status == TaskStatus::Dispatched)
        {
            self.mark_running(state, &started.task_id, outbox);
        }
    }

    fn mark_running(&self, state: &mut WorkflowState, task_id: &str, outbox: &mut Outbox) {
        if let Err(e) = state.graph.mark_running(task_id) {
            warn!(workflow_id = %state.id, task_id, error = %e, "Cannot mark task running");
            return;
        }
        let agent_id = state.in_flight.get(task_id).map(|f| f.agent_id.clone());
        outbox.push(
            event_types::TASK_RUNNING,
            serde_json::json!({ "workflow_id": state.id, "task_id": task_id, "agent_id": agent_id }),
        );
    }

    fn apply_outcome(&self, state: &mut WorkflowState, outcome: TaskOutcome, outbox: &mut Outbox) {
        if !is_current(state, &outcome.task_id, outcome.decision_id) {
            debug!(workflow_id = %state.id, task_id = %outcome.task_id, "Stale task.result ignored");
            return;
        }
        let task_id = outcome.task_id.clone();
        if state
            .graph
            .get(&task_id)
            .is_some_and(|t| t.status == TaskStatus::Dispatched)
        {
            self.mark_running(state, &task_id, outbox);
        }
        let Some(flight) = state.in_flight.remove(&task_id) else {
            return;
        };

        let latency = if outcome.latency_ms > 0 {
            Duration::from_millis(outcome.latency_ms)
        } else {
            flight.dispatched_at.elapsed()
        };
        if let Err(e) =
            self.ctx
                .registry
                .record_outcome(&flight.agent_id, &flight.task_type, outcome.success, latency)
        {
            debug!(agent_id = %flight.agent_id, error = %e, "Outcome not recorded");
        }

        if outcome.success {
            self.release(&flight.agent_id);
            let result = outcome.result.unwrap_or(serde_json::Value::Null);
            if let Err(e) = state.graph.mark_completed(&task_id, result.clone()) {
                self.fail_workflow(state, e.to_string(), outbox);
                return;
            }
            state.context.merge(outcome.context_updates);
            info!(workflow_id = %state.id, task_id = %task_id, agent_id = %flight.agent_id, "Task completed");
            outbox.push(
                event_types::TASK_COMPLETED,
                serde_json::json!({
                    "workflow_id": state.id,
                    "task_id": task_id,
                    "agent_id": flight.agent_id,
                    "latency_ms": u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    "result": result,
                }),
            );
        } else {
            let reason = outcome
                .error
                .unwrap_or_else(|| "executor reported failure".to_string());
            let err = TaskweaveError::TaskExecutionFailure {
                task_id: task_id.clone(),
                reason,
            };
            self.fail_task(state, &task_id, &err, outbox);
        }
    }

    fn expire_timeouts(&self, state: &mut WorkflowState, outbox: &mut Outbox) {
        let now = Instant::now();
        let mut expired: Vec<TaskId> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for task_id in expired {
            if state.status.is_terminal() {
                return;
            }
            let Some(flight) = state.in_flight.remove(&task_id) else {
                continue;
            };
            let elapsed = flight.dispatched_at.elapsed();
            if let Err(e) =
                self.ctx
                    .registry
                    .record_outcome(&flight.agent_id, &flight.task_type, false, elapsed)
            {
                debug!(agent_id = %flight.agent_id, error = %e, "Outcome not recorded");
            }
            let timeout_ms =
                u64::try_from(self.timeout_for(state, &task_id).as_millis()).unwrap_or(u64::MAX);
            warn!(workflow_id = %state.id, task_id = %task_id, agent_id = %flight.agent_id, timeout_ms, "Task timed out");
            outbox.push_with(
                event_types::TASK_TIMED_OUT,
                EventPriority::High,
                serde_json::json!({
                    "workflow_id": state.id,
                    "task_id": task_id,
                    "agent_id": flight.agent_id,
                    "timeout_ms": timeout_ms,
                }),
            );
            let err = TaskweaveError::TaskExecutionFailure {
                task_id: task_id.clone(),
                reason: format!("no result within {timeout_ms}ms"),
            };
            self.fail_task(state, &task_id, &err, outbox);
        }
    }

    fn timeout_for(&self, state: &WorkflowState, task_id: &str) -> Duration {
        let ms = state
            .graph
            .get(task_id)
            .and_then(|t| t.timeout_ms)
            .unwrap_or(self.config.execution_timeout_ms);
        Duration::from_millis(ms)
    }

    fn dispatch_ready(&self, state: &mut WorkflowState, outbox: &mut Outbox) {
        let now = Instant::now();
        let strategy = state.strategy;
        let mut ready: Vec<&crate::types::Task> = state
            .graph
            .ready_tasks()
            .into_iter()
            .filter(|t| state.not_before.get(&t.id).map_or(true, |at| *at <= now))
            .collect();
        TaskDispatcher::order_ready(&mut ready, strategy);
        let ids: Vec<TaskId> = ready.into_iter().map(|t| t.id.clone()).collect();

        for task_id in ids {
            if state.status != WorkflowStatus::Running {
                return;
            }
            let hints = DispatchHints {
                avoid: state.avoid.get(&task_id).cloned(),
            };
            let attempt = {
                let Some(task) = state.graph.get(&task_id) else {
                    continue;
                };
                self.dispatcher.dispatch_with(task, strategy, &hints)
            };
            match attempt {
                Ok(decision) => self.hand_off(state, &task_id, decision, outbox),
                Err(e) if e.is_recoverable() => self.defer_dispatch(state, &task_id, &e, outbox),
                Err(e) => {
                    error!(workflow_id = %state.id, task_id = %task_id, error = %e, "Dispatch failed");
                    self.fail_workflow(state, e.to_string(), outbox);
                }
            }
        }
    }

    fn hand_off(
        &self,
        state: &mut WorkflowState,
        task_id: &str,
        decision: DispatchDecision,
        outbox: &mut Outbox,
    ) {
        if let Err(e) = state.graph.mark_dispatched(task_id, &decision.agent_id) {
            self.release(&decision.agent_id);
            self.fail_workflow(state, e.to_string(), outbox);
            return;
        }
        state.not_before.remove(task_id);
        state.dispatch_failures.remove(task_id);
        state.avoid.remove(task_id);

        let timeout = self.timeout_for(state, task_id);
        let now = Instant::now();
        let Some(task) = state.graph.get(task_id) else {
            return;
        };
        let assignment = TaskAssignment {
            workflow_id: state.id,
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            decision: decision.clone(),
            parameters: task.parameters.clone(),
            priority: task.priority,
            attempt: task.attempts,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            context: state.context.snapshot(),
            dependency_results: state.graph.dependency_results(task_id),
        };
        state.in_flight.insert(
            task_id.to_string(),
            InFlight {
                decision_id: decision.id,
                agent_id: decision.agent_id.clone(),
                task_type: task.task_type.clone(),
                dispatched_at: now,
                deadline: now + timeout,
            },
        );
        state.decisions.push(decision);
        state.phase = Phase::Execution;

        match serde_json::to_value(&assignment) {
            Ok(payload) => outbox.push(event_types::TASK_DISPATCHED, payload),
            Err(e) => error!(workflow_id = %state.id, task_id, error = %e, "Cannot encode assignment"),
        }
    }

    fn defer_dispatch(
        &self,
        state: &mut WorkflowState,
        task_id: &str,
        err: &TaskweaveError,
        outbox: &mut Outbox,
    ) {
        let policy = &self.config.dispatch_retry;
        let serviceable = state
            .graph
            .get(task_id)
            .is_some_and(|t| self.dispatcher.could_serve(t));
        if serviceable {
            // Every capable agent is busy. Capacity can be freed by any
            // workflow sharing the registry, so poll at the base interval
            // without spending the dispatch budget.
            let delay = policy.compute_backoff(0).max(Duration::from_millis(1));
            debug!(
                workflow_id = %state.id,
                task_id,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Waiting for capacity"
            );
            state
                .not_before
                .insert(task_id.to_string(), Instant::now() + delay);
            return;
        }
        let failures = {
            let count = state.dispatch_failures.entry(task_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if failures >= policy.max_retries {
            warn!(workflow_id = %state.id, task_id, attempts = failures, error = %err, "Dispatch attempts exhausted");
            state.dispatch_failures.remove(task_id);
            self.fail_task(state, task_id, err, outbox);
            return;
        }
        let delay = policy.compute_backoff(failures - 1);
        debug!(
            workflow_id = %state.id,
            task_id,
            attempts = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Dispatch deferred"
        );
        state
            .not_before
            .insert(task_id.to_string(), Instant::now() + delay);
    }

    /// A failed attempt: retry within budget, otherwise fail the workflow.
    fn fail_task(
        &self,
        state: &mut WorkflowState,
        task_id: &str,
        err: &TaskweaveError,
        outbox: &mut Outbox,
    ) {
        let reason = err.to_string();
        state.in_flight.remove(task_id);
        let agent = match state.graph.mark_failed(task_id, &reason) {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_workflow(state, e.to_string(), outbox);
                return;
            }
        };
        if let Some(agent_id) = &agent {
            self.release(agent_id);
        }

        let Some(task) = state.graph.get(task_id) else {
            return;
        };
        let budget = task.max_retries.unwrap_or(self.config.default_max_retries);
        let retries_used = task.retries_used;

        if retries_used < budget {
            if let Err(e) = state.graph.mark_retry(task_id) {
                self.fail_workflow(state, e.to_string(), outbox);
                return;
            }
            if let Some(agent_id) = agent.clone() {
                state.avoid.insert(task_id.to_string(), agent_id);
            }
            if self.config.retry_backoff_ms > 0 {
                state.not_before.insert(
                    task_id.to_string(),
                    Instant::now() + Duration::from_millis(self.config.retry_backoff_ms),
                );
            }
            warn!(
                workflow_id = %state.id,
                task_id,
                retry = retries_used + 1,
                budget,
                error = %reason,
                "Task failed, retrying"
            );
            outbox.push(
                event_types::TASK_RETRYING,
                serde_json::json!({
                    "workflow_id": state.id,
                    "task_id": task_id,
                    "agent_id": agent,
                    "retry": retries_used + 1,
                    "max_retries": budget,
                    "error": reason,
                }),
            );
            return;
        }

        if let Err(e) = state.graph.conclude_failure(task_id) {
            debug!(task_id, error = %e, "Cannot record final error");
        }
        error!(workflow_id = %state.id, task_id, error = %reason, "Task failed, retry budget exhausted");
        outbox.push_with(
            event_types::TASK_FAILED,
            EventPriority::High,
            serde_json::json!({
                "workflow_id": state.id,
                "task_id": task_id,
                "agent_id": agent,
                "retries_used": retries_used,
                "error": reason,
            }),
        );
        self.fail_workflow(state, format!("task '{task_id}' failed: {reason}"), outbox);
    }

    fn fail_workflow(&self, state: &mut WorkflowState, reason: String, outbox: &mut Outbox) {
        if state.status.is_terminal() {
            return;
        }
        self.cancel_open_tasks(state, outbox);
        error!(workflow_id = %state.id, reason = %reason, "Workflow failed");
        state.status = WorkflowStatus::Failed {
            reason: reason.clone(),
        };
        state.finished_at = Some(Utc::now());
        outbox.push_with(
            event_types::WORKFLOW_FAILED,
            EventPriority::High,
            serde_json::json!({ "workflow_id": state.id, "phase": state.phase, "reason": reason }),
        );
    }

    /// Cancel every unfinished task and return the capacity it held.
    fn cancel_open_tasks(&self, state: &mut WorkflowState, outbox: &mut Outbox) {
        for (task_id, agent) in state.graph.cancel_unfinished() {
            if let Some(agent_id) = &agent {
                self.release(agent_id);
            }
            outbox.push(
                event_types::TASK_CANCELLED,
                serde_json::json!({ "workflow_id": state.id, "task_id": task_id, "agent_id": agent }),
            );
        }
        state.in_flight.clear();
        state.not_before.clear();
        state.dispatch_failures.clear();
    }

    fn finish_composition(
        &self,
        state: &mut WorkflowState,
        outcome: TaskweaveResult<serde_json::Value>,
        outbox: &mut Outbox,
    ) {
        if state.status.is_terminal() {
            return;
        }
        match outcome {
            Ok(artifact) => {
                state.artifact = Some(artifact);
                state.status = WorkflowStatus::Completed;
                state.finished_at = Some(Utc::now());
                info!(workflow_id = %state.id, tasks = state.graph.len(), "Workflow completed");
                outbox.push(
                    event_types::WORKFLOW_COMPLETED,
                    serde_json::json!({
                        "workflow_id": state.id,
                        "artifact": state.artifact,
                    }),
                );
            }
            Err(e) => self.fail_workflow(state, format!("composition failed: {e}"), outbox),
        }
    }

    fn release(&self, agent_id: &str) {
        if let Err(e) = self.ctx.registry.release(agent_id) {
            warn!(agent_id, error = %e, "Cannot release agent capacity");
        }
    }
}

/// The event refers to the attempt currently in flight.
fn is_current(state: &WorkflowState, task_id: &str, decision_id: Option<Uuid>) -> bool {
    let Some(flight) = state.in_flight.get(task_id) else {
        return false;
    };
    let in_flight = state
        .graph
        .get(task_id)
        .is_some_and(|t| t.status.is_in_flight());
    in_flight && decision_id.map_or(true, |d| d == flight.decision_id)
}
