use serde::Deserialize;
use std::path::Path;
use taskweave_orchestrator::OrchestratorConfig;

/// Contents of `taskweave.toml`: the orchestrator sections plus the
/// `[simulator]` table used by `run`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    /// Time the simulated executor spends on every task.
    #[serde(default = "default_latency_ms")]
    pub simulated_latency_ms: u64,
    /// Task types the simulated executor reports as failed.
    #[serde(default)]
    pub fail_task_types: Vec<String>,
}

fn default_latency_ms() -> u64 {
    100
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            simulated_latency_ms: default_latency_ms(),
            fail_task_types: Vec::new(),
        }
    }
}

impl CliConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults with no agents.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))
    }
}
