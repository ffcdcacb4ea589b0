use crate::scoring::ScoringWeights;
use crate::types::{Agent, DispatchStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use taskweave_bus::BusConfig;
use taskweave_core::{TaskweaveError, TaskweaveResult};

/// Exponential backoff for dispatch attempts that found no free agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Dispatch attempts allowed before the task is failed.
    #[serde(default = "default_dispatch_attempts")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap for the exponential backoff.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_dispatch_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_dispatch_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, `base * 2^attempt` capped at the maximum.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Workflow engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Strategy used when a workflow does not name one.
    #[serde(default)]
    pub default_strategy: DispatchStrategy,
    /// Pick the strategy from the task set's shape instead of the default.
    #[serde(default)]
    pub auto_select_strategy: bool,
    /// Execution retries granted to a task that does not set `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Budget for a dispatched task to report its result.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Delay before a failed task is dispatched again.
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// Backoff for dispatch attempts that found no free agent.
    #[serde(default)]
    pub dispatch_retry: RetryPolicy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_execution_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_strategy: DispatchStrategy::default(),
            auto_select_strategy: false,
            default_max_retries: default_max_retries(),
            execution_timeout_ms: default_execution_timeout_ms(),
            retry_backoff_ms: 0,
            dispatch_retry: RetryPolicy::default(),
        }
    }
}

/// Agent selection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Factor weights for scored strategies.
    #[serde(default)]
    pub weights: ScoringWeights,
    /// Similarity credited to related (non-identical) capability tags.
    #[serde(default = "default_partial_credit")]
    pub partial_credit: f64,
    /// Extra related-tag pairs: each key is related to every listed tag.
    #[serde(default)]
    pub related_capabilities: HashMap<String, Vec<String>>,
    /// Number of dispatch decisions kept for inspection.
    #[serde(default = "default_decision_history")]
    pub history_size: usize,
}

fn default_partial_credit() -> f64 {
    0.5
}

fn default_decision_history() -> usize {
    1_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            partial_credit: default_partial_credit(),
            related_capabilities: HashMap::new(),
            history_size: default_decision_history(),
        }
    }
}

/// Agent registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Smoothing factor of the per-type performance averages.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
}

fn default_ewma_alpha() -> f64 {
    0.2
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: default_ewma_alpha(),
        }
    }
}

/// Complete orchestrator configuration, as read from `taskweave.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// `[bus]` section.
    #[serde(default)]
    pub bus: BusConfig,
    /// `[engine]` section.
    #[serde(default)]
    pub engine: EngineConfig,
    /// `[dispatch]` section.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// `[registry]` section.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Agents registered at startup, from `[[agents]]`.
    #[serde(default)]
    pub agents: Vec<Agent>,
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> TaskweaveResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| TaskweaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> TaskweaveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TaskweaveError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges and agent declarations.
    pub fn validate(&self) -> TaskweaveResult<()> {
        if self.bus.queue_capacity == 0 {
            return Err(TaskweaveError::Config(
                "bus.queue_capacity must be at least 1".into(),
            ));
        }
        if !(self.registry.ewma_alpha > 0.0 && self.registry.ewma_alpha <= 1.0) {
            return Err(TaskweaveError::Config(format!(
                "registry.ewma_alpha must be in (0, 1], got {}",
                self.registry.ewma_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.dispatch.partial_credit) {
            return Err(TaskweaveError::Config(format!(
                "dispatch.partial_credit must be in [0, 1], got {}",
                self.dispatch.partial_credit
            )));
        }
        self.dispatch.weights.validate()?;
        if self.engine.dispatch_retry.max_retries == 0 {
            return Err(TaskweaveError::Config(
                "engine.dispatch_retry.max_retries must be at least 1".into(),
            ));
        }
        if self.engine.execution_timeout_ms == 0 {
            return Err(TaskweaveError::Config(
                "engine.execution_timeout_ms must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.capacity == 0 {
                return Err(TaskweaveError::Config(format!(
                    "agent '{}' declares capacity 0",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(TaskweaveError::Config(format!(
                    "agent '{}' is declared twice",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}
