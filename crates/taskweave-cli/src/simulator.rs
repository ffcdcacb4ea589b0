//! Stand-in executor that answers every assignment after a fixed latency.

use crate::settings::SimulatorConfig;
use std::sync::Arc;
use std::time::Duration;
use taskweave_bus::{event_types, EventBus, SubscriptionHandle};
use taskweave_core::TaskweaveResult;
use taskweave_orchestrator::TaskAssignment;
use tracing::{debug, info};

/// Subscribe the simulated executor to `task.dispatched`.
///
/// Each assignment is acknowledged with `task.started` and answered with
/// `task.result` after `simulated_latency_ms`. The result echoes the agent,
/// task type, attempt and parameters; the task id is recorded in the
/// execution context under `last_completed`.
pub fn attach(bus: &Arc<EventBus>, config: SimulatorConfig) -> TaskweaveResult<SubscriptionHandle> {
    let config = Arc::new(config);
    let publisher = bus.clone();
    let handle = bus.subscribe_async(event_types::TASK_DISPATCHED, 0, move |event| {
        let config = config.clone();
        let bus = publisher.clone();
        async move {
            let assignment: TaskAssignment = event.payload_as()?;
            tokio::spawn(execute(bus, assignment, config));
            Ok(())
        }
    })?;
    info!("Simulated executor attached");
    Ok(handle)
}

async fn execute(bus: Arc<EventBus>, assignment: TaskAssignment, config: Arc<SimulatorConfig>) {
    let source = format!("simulator.{}", assignment.agent_id());
    if let Err(e) = bus.publish(assignment.started().into_event(source.clone())).await {
        debug!(error = %e, "Bus closed before task start");
        return;
    }

    let latency = Duration::from_millis(config.simulated_latency_ms);
    tokio::time::sleep(latency).await;

    let outcome = if config.fail_task_types.contains(&assignment.task_type) {
        assignment.failed(format!(
            "simulated failure for task type '{}'",
            assignment.task_type
        ))
    } else {
        assignment
            .succeeded(serde_json::json!({
                "agent": assignment.agent_id(),
                "task_type": assignment.task_type,
                "attempt": assignment.attempt,
                "parameters": assignment.parameters,
            }))
            .with_context_update("last_completed", serde_json::json!(assignment.task_id))
    };
    debug!(
        task_id = %assignment.task_id,
        agent_id = %assignment.agent_id(),
        success = outcome.success,
        "Simulated task finished"
    );
    if let Err(e) = bus.publish(outcome.with_latency(latency).into_event(source)).await {
        debug!(error = %e, "Bus closed before task result");
    }
}
