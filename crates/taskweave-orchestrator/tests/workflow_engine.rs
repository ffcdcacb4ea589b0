//! End-to-end tests for the workflow engine.
//!
//! A mock executor subscribes to `task.dispatched` and answers over the bus
//! exactly like a real executor would, so these tests exercise planning,
//! dispatch, retries, timeouts and composition through the public surface.

mod common;

use async_trait::async_trait;
use common::{count_events, engine, eventually, Behavior, MockExecutor};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskweave_bus::{event_types, Event};
use taskweave_core::{TaskweaveError, TaskweaveResult};
use taskweave_orchestrator::*;
use tokio::sync::Notify;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn quick_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.engine.dispatch_retry = RetryPolicy {
        max_retries: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
    };
    config
}

fn task_id_of(event: &Event) -> Option<String> {
    event
        .payload
        .get("task_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn find_task<'a>(report: &'a WorkflowReport, id: &str) -> &'a TaskReport {
    report.tasks.iter().find(|t| t.id == id).unwrap()
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dependents_wait_for_all_dependencies() {
    let engine = engine(
        vec![Agent::new("worker", 2).with_capabilities(["search", "merge"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(20), |a| {
        Behavior::Succeed(json!(format!("{}-done", a.task_id)))
    });

    let def = WorkflowDefinition::new("fan-in")
        .with_task(Task::new("a", "search"))
        .with_task(Task::new("b", "search"))
        .with_task(Task::new("c", "merge").with_dependencies(["a", "b"]));
    let id = engine.submit(def).await.unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);

    let history = bus.history(None, usize::MAX);
    let position = |event_type: &str, task: &str| {
        history
            .iter()
            .position(|e| e.event_type == event_type && task_id_of(e).as_deref() == Some(task))
            .unwrap()
    };
    let c_dispatched = position(event_types::TASK_DISPATCHED, "c");
    assert!(position(event_types::TASK_COMPLETED, "a") < c_dispatched);
    assert!(position(event_types::TASK_COMPLETED, "b") < c_dispatched);

    let c = executor.assignment("c").unwrap();
    assert_eq!(c.dependency_results["a"], json!("a-done"));
    assert_eq!(c.dependency_results["b"], json!("b-done"));

    let report = engine.report(id).await.unwrap();
    assert_eq!(
        report.artifact,
        Some(json!({ "a": "a-done", "b": "b-done", "c": "c-done" }))
    );
    assert_eq!(report.counts.completed, 3);
    assert_eq!(report.decisions.len(), 3);
    assert_eq!(bus.history(Some(event_types::WORKFLOW_COMPLETED), 10).len(), 1);
}

#[tokio::test]
async fn test_task_status_history_is_recorded() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["search"])],
        quick_config(),
    );
    let _executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(5), |_| {
        Behavior::Succeed(json!(1))
    });

    let id = engine
        .submit(WorkflowDefinition::new("single").with_task(Task::new("only", "search")))
        .await
        .unwrap();
    engine.wait(id, WAIT).await.unwrap();

    let report = engine.report(id).await.unwrap();
    let only = find_task(&report, "only");
    assert_eq!(
        only.history,
        vec![
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Dispatched,
            TaskStatus::Running,
            TaskStatus::Completed,
        ]
    );
    assert_eq!(only.attempts, 1);
    assert_eq!(only.assigned_agent.as_deref(), Some("worker"));
    assert!(report.finished_at.is_some());
}

#[tokio::test]
async fn test_context_updates_reach_later_tasks() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["login", "fetch"])],
        quick_config(),
    );
    let executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(5), |a| {
        if a.task_id == "login" {
            Behavior::SucceedWithContext(json!("ok"), "token".into(), json!("abc123"))
        } else {
            Behavior::Succeed(json!("page"))
        }
    });

    let def = WorkflowDefinition::new("session")
        .with_context("user", json!("ada"))
        .with_task(Task::new("login", "login"))
        .with_task(Task::new("fetch", "fetch").with_dependencies(["login"]));
    let id = engine.submit(def).await.unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);

    let login = executor.assignment("login").unwrap();
    assert_eq!(login.context["user"], json!("ada"));
    assert!(!login.context.contains_key("token"));

    let fetch = executor.assignment("fetch").unwrap();
    assert_eq!(fetch.context["token"], json!("abc123"));
    assert_eq!(fetch.context["user"], json!("ada"));

    let report = engine.report(id).await.unwrap();
    assert_eq!(report.context["token"], json!("abc123"));
}

// ---------------------------------------------------------------------------
// Rejection at planning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cycle_is_rejected_before_any_dispatch() {
    let engine = engine(
        vec![Agent::new("worker", 3).with_capabilities(["x"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let def = WorkflowDefinition::new("loop")
        .with_task(Task::new("a", "x").with_dependencies(["c"]))
        .with_task(Task::new("b", "x").with_dependencies(["a"]))
        .with_task(Task::new("c", "x").with_dependencies(["b"]));

    let err = engine.submit(def).await.unwrap_err();
    match err {
        TaskweaveError::CyclicDependency { cycle } => {
            assert_eq!(cycle.len(), 4);
            assert_eq!(cycle.first(), cycle.last());
            for id in ["a", "b", "c"] {
                assert!(cycle.iter().any(|c| c == id));
            }
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    assert_eq!(count_events(&bus, event_types::TASK_DISPATCHED), 0);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_FAILED), 1);
    let listed = engine.list();
    assert_eq!(listed.len(), 1);
    assert!(matches!(listed[0].status, WorkflowStatus::Failed { .. }));

    let report = engine.report(listed[0].id).await.unwrap();
    assert_eq!(report.phase, Phase::Planning);
    assert!(report.decisions.is_empty());
}

// ---------------------------------------------------------------------------
// Retries and failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_retry_budget_is_honoured_exactly() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["flaky"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(5), |_| {
        Behavior::Fail("upstream 503".into())
    });

    let def = WorkflowDefinition::new("doomed")
        .with_task(Task::new("flaky", "flaky").with_max_retries(2));
    let id = engine.submit(def).await.unwrap();
    let status = engine.wait(id, WAIT).await.unwrap();

    let WorkflowStatus::Failed { reason } = &status else {
        panic!("expected failure, got {status}");
    };
    assert!(reason.contains("flaky"));
    assert!(reason.contains("upstream 503"));

    assert_eq!(executor.count_for("flaky"), 3);
    assert_eq!(count_events(&bus, event_types::TASK_RETRYING), 2);
    assert_eq!(count_events(&bus, event_types::TASK_FAILED), 1);

    let report = engine.report(id).await.unwrap();
    let flaky = find_task(&report, "flaky");
    assert_eq!(flaky.status, TaskStatus::Failed);
    assert_eq!(flaky.retries_used, 2);
    assert_eq!(flaky.attempts, 3);
    assert!(flaky.error.as_deref().unwrap().contains("upstream 503"));
    assert_eq!(engine.context().registry.get("worker").unwrap().active_tasks, 0);
}

#[tokio::test]
async fn test_retry_prefers_a_different_agent() {
    let engine = engine(
        vec![
            Agent::new("alpha", 1).with_capabilities(["search"]),
            Agent::new("beta", 1).with_capabilities(["search"]),
        ],
        quick_config(),
    );
    let executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(5), |a| {
        if a.agent_id() == "alpha" {
            Behavior::Fail("alpha is broken".into())
        } else {
            Behavior::Succeed(json!("found"))
        }
    });

    let def = WorkflowDefinition::new("retry-elsewhere")
        .with_strategy(DispatchStrategy::OptimalAssignment)
        .with_task(Task::new("q", "search").with_max_retries(1));
    let id = engine.submit(def).await.unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);

    let agents: Vec<String> = executor
        .assignments
        .lock()
        .iter()
        .map(|a| a.agent_id().to_string())
        .collect();
    assert_eq!(agents, vec!["alpha", "beta"]);

    let alpha = engine.context().registry.get("alpha").unwrap();
    assert!(alpha.performance("search").unwrap().success_rate < 0.5);
}

#[tokio::test]
async fn test_terminal_failure_cancels_siblings() {
    let engine = engine(
        vec![Agent::new("worker", 2).with_capabilities(["bad", "slow"])],
        quick_config(),
    );
    let _executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(30), |a| {
        if a.task_id == "bad" {
            Behavior::Fail("boom".into())
        } else {
            Behavior::Hang
        }
    });

    let def = WorkflowDefinition::new("mixed")
        .with_task(Task::new("bad", "bad").with_max_retries(0))
        .with_task(Task::new("slow", "slow"));
    let id = engine.submit(def).await.unwrap();
    let status = engine.wait(id, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Failed { .. }));

    let report = engine.report(id).await.unwrap();
    assert_eq!(find_task(&report, "bad").status, TaskStatus::Failed);
    assert_eq!(find_task(&report, "slow").status, TaskStatus::Cancelled);
    assert_eq!(engine.context().registry.get("worker").unwrap().active_tasks, 0);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["stall"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(1), |_| Behavior::Hang);

    let def = WorkflowDefinition::new("stalled").with_task(
        Task::new("s", "stall")
            .with_timeout_ms(40)
            .with_max_retries(1),
    );
    let id = engine.submit(def).await.unwrap();
    let status = engine.wait(id, WAIT).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Failed { .. }));

    assert_eq!(executor.count_for("s"), 2);
    assert_eq!(count_events(&bus, event_types::TASK_TIMED_OUT), 2);
    assert_eq!(executor.assignment("s").unwrap().timeout_ms, 40);
    assert_eq!(engine.context().registry.get("worker").unwrap().active_tasks, 0);
}

#[tokio::test]
async fn test_dispatch_escalates_when_no_agent_exists() {
    let mut config = quick_config();
    config.engine.default_max_retries = 0;
    config.engine.dispatch_retry.max_retries = 2;
    let engine = engine(vec![], config);

    let def = WorkflowDefinition::new("orphan").with_task(Task::new("t", "nobody-does-this"));
    let id = engine.submit(def).await.unwrap();
    let status = engine.wait(id, WAIT).await.unwrap();

    let WorkflowStatus::Failed { reason } = &status else {
        panic!("expected failure, got {status}");
    };
    assert!(reason.contains("No eligible agent"));
    let report = engine.report(id).await.unwrap();
    assert_eq!(find_task(&report, "t").status, TaskStatus::Failed);
    assert_eq!(find_task(&report, "t").attempts, 0);
}

#[tokio::test]
async fn test_stale_result_is_ignored() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["x"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(1), |_| Behavior::Hang);

    let id = engine
        .submit(WorkflowDefinition::new("stale").with_task(Task::new("t", "x")))
        .await
        .unwrap();
    let seen = &executor;
    assert!(eventually(|| async move { seen.count_for("t") == 1 }).await);
    let assignment = executor.assignment("t").unwrap();

    let mut stale = assignment.succeeded(json!("old"));
    stale.decision_id = Some(Uuid::new_v4());
    bus.publish(stale.into_event("test")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.status(id).unwrap(), WorkflowStatus::Running);

    bus.publish(assignment.succeeded(json!("fresh")).into_event("test"))
        .await
        .unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);
    let report = engine.report(id).await.unwrap();
    assert_eq!(report.results["t"], json!("fresh"));
}

// ---------------------------------------------------------------------------
// Control surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let engine = engine(
        vec![Agent::new("worker", 1).with_capabilities(["step"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(40), |_| {
        Behavior::Succeed(json!(true))
    });

    let def = WorkflowDefinition::new("chain")
        .with_task(Task::new("first", "step"))
        .with_task(Task::new("second", "step").with_dependencies(["first"]));
    let id = engine.submit(def).await.unwrap();
    engine.pause(id).await.unwrap();
    assert_eq!(engine.status(id).unwrap(), WorkflowStatus::Paused);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.count_for("second"), 0);
    assert_eq!(engine.status(id).unwrap(), WorkflowStatus::Paused);
    assert!(matches!(
        engine.pause(id).await,
        Err(TaskweaveError::InvalidTransition { .. })
    ));

    engine.resume(id).await.unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(executor.count_for("second"), 1);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_PAUSED), 1);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_RESUMED), 1);
}

#[tokio::test]
async fn test_cancel_releases_capacity_and_is_idempotent() {
    let engine = engine(
        vec![Agent::new("worker", 2).with_capabilities(["long"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(1), |_| Behavior::Hang);

    let def = WorkflowDefinition::new("long")
        .with_task(Task::new("one", "long"))
        .with_task(Task::new("two", "long"))
        .with_task(Task::new("three", "long").with_dependencies(["one"]));
    let id = engine.submit(def).await.unwrap();
    let seen = &executor;
    assert!(eventually(|| async move { seen.assignments.lock().len() == 2 }).await);
    assert_eq!(engine.context().registry.get("worker").unwrap().active_tasks, 2);

    let status = engine.cancel(id).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Cancelled { .. }));
    assert_eq!(engine.context().registry.get("worker").unwrap().active_tasks, 0);
    assert_eq!(engine.cancel(id).await.unwrap(), status);

    let late = executor.assignment("one").unwrap().succeeded(json!("late"));
    bus.publish(late.into_event("test")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = engine.report(id).await.unwrap();
    assert_eq!(report.status, status);
    assert_eq!(report.counts.cancelled, 3);
    assert!(report.results.is_empty());
    assert_eq!(count_events(&bus, event_types::TASK_CANCELLED), 3);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_CANCELLED), 1);
}

/// Holds planning until the test opens the gate.
struct GatedPlanner {
    gate: Arc<Notify>,
}

#[async_trait]
impl Planner for GatedPlanner {
    async fn plan(&self, definition: &WorkflowDefinition) -> TaskweaveResult<Vec<Task>> {
        self.gate.notified().await;
        Ok(definition.tasks.clone())
    }
}

#[tokio::test]
async fn test_workflow_is_pending_while_planning_and_can_be_cancelled() {
    let config = quick_config();
    let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
    registry
        .register(Agent::new("worker", 1).with_capabilities(["x"]))
        .unwrap();
    let bus = taskweave_bus::EventBus::start(config.bus.clone());
    let gate = Arc::new(Notify::new());
    let engine = WorkflowEngine::with_contracts(
        OrchestrationContext::new(bus.clone(), registry),
        &config,
        Arc::new(GatedPlanner { gate: gate.clone() }),
        Arc::new(CollectingComposer),
    )
    .unwrap();

    let submitter = engine.clone();
    let submission = tokio::spawn(async move {
        submitter
            .submit(WorkflowDefinition::new("gated").with_task(Task::new("t", "x")))
            .await
    });
    let listing = &engine;
    assert!(eventually(|| async move { listing.list().len() == 1 }).await);

    let id = engine.list()[0].id;
    assert_eq!(engine.status(id).unwrap(), WorkflowStatus::Pending);
    assert!(matches!(
        engine.pause(id).await,
        Err(TaskweaveError::InvalidTransition { .. })
    ));
    let status = engine.cancel(id).await.unwrap();
    assert!(matches!(status, WorkflowStatus::Cancelled { .. }));

    gate.notify_one();
    assert_eq!(submission.await.unwrap().unwrap(), id);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(engine.status(id).unwrap(), status);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_STARTED), 0);
    assert_eq!(count_events(&bus, event_types::TASK_DISPATCHED), 0);
    assert_eq!(count_events(&bus, event_types::WORKFLOW_CANCELLED), 1);
    let report = engine.report(id).await.unwrap();
    assert_eq!(report.phase, Phase::Planning);
    assert!(report.started_at.is_none());
}

#[tokio::test]
async fn test_auto_selected_strategy_for_prioritised_work() {
    let mut config = quick_config();
    config.engine.auto_select_strategy = true;
    let engine = engine(vec![Agent::new("worker", 1).with_capabilities(["x"])], config);
    let _executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(1), |_| {
        Behavior::Succeed(json!(null))
    });

    let def = WorkflowDefinition::new("urgent")
        .with_task(Task::new("low", "x"))
        .with_task(Task::new("high", "x").with_priority(5));
    let id = engine.submit(def).await.unwrap();
    engine.wait(id, WAIT).await.unwrap();

    let report = engine.report(id).await.unwrap();
    assert_eq!(report.strategy, DispatchStrategy::PriorityFirst);
    assert_eq!(report.decisions[0].task_id, "high");
}

// ---------------------------------------------------------------------------
// Workflows sharing one registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_capacity_freed_by_another_workflow_is_picked_up() {
    let engine = engine(
        vec![
            Agent::new("xs", 1).with_capabilities(["x"]),
            Agent::new("ys", 1).with_capabilities(["y"]),
        ],
        quick_config(),
    );
    let registry = engine.context().registry.clone();
    let executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(50), |a| {
        if a.task_id == "x1" {
            Behavior::Hang
        } else {
            Behavior::Succeed(json!(a.task_id))
        }
    });

    let holder = engine
        .submit(WorkflowDefinition::new("holder").with_task(Task::new("y1", "y")))
        .await
        .unwrap();
    let seen = &executor;
    assert!(eventually(|| async move { seen.count_for("y1") == 1 }).await);

    // x1 never finishes, so this workflow always has something in flight.
    let waiter = engine
        .submit(
            WorkflowDefinition::new("waiter")
                .with_task(Task::new("x1", "x"))
                .with_task(Task::new("y2", "y")),
        )
        .await
        .unwrap();

    assert_eq!(engine.wait(holder, WAIT).await.unwrap(), WorkflowStatus::Completed);
    assert!(eventually(|| async move { seen.count_for("y2") == 1 }).await);
    assert_eq!(executor.assignment("y2").unwrap().agent_id(), "ys");

    let r = &registry;
    let engine_ref = &engine;
    assert!(
        eventually(|| async move {
            engine_ref
                .report(waiter)
                .await
                .is_ok_and(|report| report.counts.completed == 1)
        })
        .await
    );
    assert_eq!(engine.status(waiter).unwrap(), WorkflowStatus::Running);

    engine.cancel(waiter).await.unwrap();
    assert!(eventually(|| async move { r.get("xs").is_some_and(|a| a.active_tasks == 0) }).await);
}

#[tokio::test]
async fn test_concurrent_workflows_share_one_agent() {
    let engine = engine(
        vec![Agent::new("solo", 1).with_capabilities(["work"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    let registry = engine.context().registry.clone();
    let peak = Arc::new(AtomicUsize::new(0));

    let observed = peak.clone();
    let watched = registry.clone();
    bus.subscribe(event_types::WILDCARD, 0, move |_| {
        if let Some(agent) = watched.get("solo") {
            observed.fetch_max(agent.active_tasks, Ordering::SeqCst);
        }
        Ok(())
    })
    .unwrap();
    let executor = MockExecutor::attach(&bus, Duration::from_millis(10), |a| {
        Behavior::Succeed(json!(a.task_id))
    });

    let first = engine
        .submit(WorkflowDefinition::new("first").with_tasks(
            ["a1", "a2", "a3"].map(|id| Task::new(id, "work")),
        ))
        .await
        .unwrap();
    let second = engine
        .submit(WorkflowDefinition::new("second").with_tasks(
            ["b1", "b2", "b3"].map(|id| Task::new(id, "work")),
        ))
        .await
        .unwrap();

    assert_eq!(engine.wait(first, WAIT).await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(engine.wait(second, WAIT).await.unwrap(), WorkflowStatus::Completed);

    assert_eq!(executor.assignments.lock().len(), 6);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(registry.get("solo").unwrap().active_tasks, 0);
    for id in [first, second] {
        let report = engine.report(id).await.unwrap();
        assert_eq!(report.counts.completed, 3);
        assert!(report.decisions.iter().all(|d| d.agent_id == "solo"));
    }
}

#[tokio::test]
async fn test_busy_agent_does_not_spend_dispatch_budget() {
    let engine = engine(
        vec![Agent::new("solo", 1).with_capabilities(["work"])],
        quick_config(),
    );
    let bus = engine.context().bus.clone();
    // Far longer than three 1-5ms dispatch backoffs.
    let executor = MockExecutor::attach(&bus, Duration::from_millis(300), |a| {
        Behavior::Succeed(json!(a.task_id))
    });

    let first = engine
        .submit(WorkflowDefinition::new("first").with_task(Task::new("a", "work")))
        .await
        .unwrap();
    let seen = &executor;
    assert!(eventually(|| async move { seen.count_for("a") == 1 }).await);
    let second = engine
        .submit(WorkflowDefinition::new("second").with_task(Task::new("b", "work")))
        .await
        .unwrap();

    assert_eq!(engine.wait(first, WAIT).await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(engine.wait(second, WAIT).await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(executor.count_for("b"), 1);
    assert_eq!(count_events(&bus, event_types::TASK_RETRYING), 0);
    let report = engine.report(second).await.unwrap();
    assert_eq!(find_task(&report, "b").attempts, 1);
}

// ---------------------------------------------------------------------------
// Custom planner and composer
// ---------------------------------------------------------------------------

/// One `research` task per comma-separated topic in the objective.
struct TopicPlanner;

#[async_trait]
impl Planner for TopicPlanner {
    async fn plan(&self, definition: &WorkflowDefinition) -> TaskweaveResult<Vec<Task>> {
        let objective = definition.objective.as_deref().unwrap_or_default();
        Ok(objective
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|topic| Task::new(topic, "research"))
            .collect())
    }
}

/// Counts successful results.
struct CountingComposer;

#[async_trait]
impl Composer for CountingComposer {
    async fn compose(&self, input: CompositionInput) -> TaskweaveResult<serde_json::Value> {
        Ok(json!({ "name": input.name, "results": input.results.len() }))
    }
}

struct RefusingComposer;

#[async_trait]
impl Composer for RefusingComposer {
    async fn compose(&self, _input: CompositionInput) -> TaskweaveResult<serde_json::Value> {
        Err(TaskweaveError::InvalidArgument("nothing to compose".into()))
    }
}

fn engine_with_contracts(composer: Arc<dyn Composer>) -> WorkflowEngine {
    let config = quick_config();
    let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
    registry
        .register(Agent::new("researcher", 4).with_capabilities(["research"]))
        .unwrap();
    let bus = taskweave_bus::EventBus::start(config.bus.clone());
    WorkflowEngine::with_contracts(
        OrchestrationContext::new(bus, registry),
        &config,
        Arc::new(TopicPlanner),
        composer,
    )
    .unwrap()
}

#[tokio::test]
async fn test_custom_planner_and_composer() {
    let engine = engine_with_contracts(Arc::new(CountingComposer));
    let executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(5), |a| {
        Behavior::Succeed(json!(a.task_id))
    });

    let mut def = WorkflowDefinition::new("survey");
    def.objective = Some("rust, tokio, serde".into());
    let id = engine.submit(def).await.unwrap();
    assert_eq!(engine.wait(id, WAIT).await.unwrap(), WorkflowStatus::Completed);

    assert_eq!(executor.assignments.lock().len(), 3);
    let report = engine.report(id).await.unwrap();
    assert_eq!(report.artifact, Some(json!({ "name": "survey", "results": 3 })));
}

#[tokio::test]
async fn test_composer_error_fails_workflow() {
    let engine = engine_with_contracts(Arc::new(RefusingComposer));
    let _executor = MockExecutor::attach(&engine.context().bus, Duration::from_millis(5), |_| {
        Behavior::Succeed(json!(1))
    });

    let mut def = WorkflowDefinition::new("fruitless");
    def.objective = Some("only".into());
    let id = engine.submit(def).await.unwrap();
    let status = engine.wait(id, WAIT).await.unwrap();

    let WorkflowStatus::Failed { reason } = &status else {
        panic!("expected failure, got {status}");
    };
    assert!(reason.contains("composition failed"));
    let report = engine.report(id).await.unwrap();
    assert_eq!(report.phase, Phase::Composition);
    assert!(report.artifact.is_none());
    assert_eq!(report.counts.completed, 1);
}
