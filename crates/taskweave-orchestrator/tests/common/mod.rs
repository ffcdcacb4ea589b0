//! Mock executor and helpers shared by the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taskweave_bus::{event_types, BusConfig, EventBus};
use taskweave_orchestrator::{
    Agent, AgentRegistry, OrchestrationContext, OrchestratorConfig, TaskAssignment, WorkflowEngine,
};

/// What the mock executor does with one assignment.
#[derive(Clone)]
pub enum Behavior {
    Succeed(serde_json::Value),
    /// Succeed and merge `(key, value)` into the execution context.
    SucceedWithContext(serde_json::Value, String, serde_json::Value),
    Fail(String),
    /// Never report back.
    Hang,
}

type Script = Arc<dyn Fn(&TaskAssignment) -> Behavior + Send + Sync>;

/// Subscribes to `task.dispatched` and answers each assignment after `delay`.
pub struct MockExecutor {
    pub assignments: Arc<Mutex<Vec<TaskAssignment>>>,
}

impl MockExecutor {
    pub fn attach<F>(bus: &Arc<EventBus>, delay: Duration, script: F) -> Self
    where
        F: Fn(&TaskAssignment) -> Behavior + Send + Sync + 'static,
    {
        let assignments = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(script);
        let seen = assignments.clone();
        let publisher = bus.clone();

        bus.subscribe_async(event_types::TASK_DISPATCHED, 0, move |event| {
            let seen = seen.clone();
            let script = script.clone();
            let bus = publisher.clone();
            async move {
                let assignment: TaskAssignment = event.payload_as()?;
                seen.lock().push(assignment.clone());
                let behavior = script(&assignment);
                tokio::spawn(async move {
                    bus.publish(assignment.started().into_event("mock")).await.ok();
                    tokio::time::sleep(delay).await;
                    let outcome = match behavior {
                        Behavior::Succeed(value) => assignment.succeeded(value),
                        Behavior::SucceedWithContext(value, key, ctx) => {
                            assignment.succeeded(value).with_context_update(key, ctx)
                        }
                        Behavior::Fail(reason) => assignment.failed(reason),
                        Behavior::Hang => return,
                    };
                    bus.publish(outcome.with_latency(delay).into_event("mock"))
                        .await
                        .ok();
                });
                Ok(())
            }
        })
        .unwrap();

        Self { assignments }
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.assignments
            .lock()
            .iter()
            .map(|a| a.task_id.clone())
            .collect()
    }

    pub fn count_for(&self, task_id: &str) -> usize {
        self.assignments
            .lock()
            .iter()
            .filter(|a| a.task_id == task_id)
            .count()
    }

    pub fn assignment(&self, task_id: &str) -> Option<TaskAssignment> {
        self.assignments
            .lock()
            .iter()
            .rev()
            .find(|a| a.task_id == task_id)
            .cloned()
    }
}

pub fn engine(agents: Vec<Agent>, config: OrchestratorConfig) -> WorkflowEngine {
    let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
    for agent in agents {
        registry.register(agent).unwrap();
    }
    let bus = EventBus::start(BusConfig::default());
    WorkflowEngine::new(OrchestrationContext::new(bus, registry), &config).unwrap()
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn count_events(bus: &EventBus, event_type: &str) -> usize {
    bus.history(Some(event_type), usize::MAX).len()
}
