use crate::config::OrchestratorConfig;
use crate::registry::AgentRegistry;
use std::sync::Arc;
use taskweave_bus::EventBus;
use taskweave_core::TaskweaveResult;

/// The shared services a workflow engine runs against.
///
/// Constructed explicitly and passed to the engine; several engines or
/// executors may share one context.
#[derive(Clone)]
pub struct OrchestrationContext {
    /// Event bus used for every workflow and executor event.
    pub bus: Arc<EventBus>,
    /// Agents shared by every workflow.
    pub registry: Arc<AgentRegistry>,
}

impl OrchestrationContext {
    /// Bundle an existing bus and registry.
    pub fn new(bus: Arc<EventBus>, registry: Arc<AgentRegistry>) -> Self {
        Self { bus, registry }
    }

    /// Start a bus and build a registry holding the configured agents.
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &OrchestratorConfig) -> TaskweaveResult<Self> {
        let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
        for agent in &config.agents {
            registry.register(agent.clone())?;
        }
        let bus = EventBus::start(config.bus.clone());
        Ok(Self { bus, registry })
    }
}
