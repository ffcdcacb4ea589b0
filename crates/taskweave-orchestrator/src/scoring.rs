//! Agent suitability scoring.
//!
//! A score is a weighted blend of five factors, each in `[0, 1]`:
//!
//! | factor | default weight | value |
//! |---|---|---|
//! | capability | 0.40 | average best tag similarity over the wanted tags |
//! | load | 0.20 | `1 - active / capacity` |
//! | performance | 0.20 | success rate for the task type, 0.5 without history |
//! | preference | 0.10 | 1.0 if the agent lists the task type as a preference |
//! | category | 0.10 | 1.0 if the agent's category is the preferred one, else 0.5 |
//!
//! [`score`] is a pure function: the same task, snapshot, weights and
//! similarity always produce the same breakdown.

use crate::config::DispatchConfig;
use crate::registry::AgentSnapshot;
use crate::types::Task;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskweave_core::{TaskweaveError, TaskweaveResult};

/// Relative weights of the score factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Capability match.
    #[serde(default = "default_capability")]
    pub capability: f64,
    /// Free capacity.
    #[serde(default = "default_load")]
    pub load: f64,
    /// Past success rate for the task type.
    #[serde(default = "default_performance")]
    pub performance: f64,
    /// Task type listed in the agent's preferences.
    #[serde(default = "default_preference")]
    pub preference: f64,
    /// Preferred category match.
    #[serde(default = "default_category")]
    pub category: f64,
}

fn default_capability() -> f64 {
    0.4
}

fn default_load() -> f64 {
    0.2
}

fn default_performance() -> f64 {
    0.2
}

fn default_preference() -> f64 {
    0.1
}

fn default_category() -> f64 {
    0.1
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: default_capability(),
            load: default_load(),
            performance: default_performance(),
            preference: default_preference(),
            category: default_category(),
        }
    }
}

impl ScoringWeights {
    fn sum(&self) -> f64 {
        self.capability + self.load + self.performance + self.preference + self.category
    }

    /// Weights must be non-negative and sum to a positive value.
    pub fn validate(&self) -> TaskweaveResult<()> {
        let all = [
            self.capability,
            self.load,
            self.performance,
            self.preference,
            self.category,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TaskweaveError::Config(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        if self.sum() <= 0.0 {
            return Err(TaskweaveError::Config(
                "at least one scoring weight must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How well an offered capability tag serves a wanted one, in `[0, 1]`.
pub trait CapabilitySimilarity: Send + Sync {
    /// Similarity of a wanted tag to an offered tag, in `[0, 1]`.
    fn similarity(&self, wanted: &str, offered: &str) -> f64;
}

/// Default similarity: exact tags score 1.0; related tags score the partial
/// credit; everything else scores 0.0.
///
/// Two tags are related when a pair was configured explicitly or when they
/// share a dotted namespace root, so `search.web` and `search.news` are
/// related and so are `search` and `search.web`.
#[derive(Debug, Clone)]
pub struct TagSimilarity {
    partial_credit: f64,
    related: HashMap<String, HashSet<String>>,
}

impl TagSimilarity {
    /// Exact matches and shared dotted roots only.
    pub fn new(partial_credit: f64) -> Self {
        Self {
            partial_credit: partial_credit.clamp(0.0, 1.0),
            related: HashMap::new(),
        }
    }

    /// Include the configured related pairs.
    pub fn from_config(config: &DispatchConfig) -> Self {
        let mut similarity = Self::new(config.partial_credit);
        for (tag, related) in &config.related_capabilities {
            for other in related {
                similarity.relate(tag, other);
            }
        }
        similarity
    }

    /// Declare a symmetric relation between two tags.
    pub fn with_related(mut self, a: &str, b: &str) -> Self {
        self.relate(a, b);
        self
    }

    fn relate(&mut self, a: &str, b: &str) {
        self.related
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.related
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    fn is_related(&self, wanted: &str, offered: &str) -> bool {
        if self
            .related
            .get(wanted)
            .is_some_and(|set| set.contains(offered))
        {
            return true;
        }
        (wanted.contains('.') || offered.contains('.')) && root(wanted) == root(offered)
    }
}

impl Default for TagSimilarity {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn root(tag: &str) -> &str {
    tag.split('.').next().unwrap_or(tag)
}

impl CapabilitySimilarity for TagSimilarity {
    fn similarity(&self, wanted: &str, offered: &str) -> f64 {
        if wanted == offered {
            1.0
        } else if self.is_related(wanted, offered) {
            self.partial_credit
        } else {
            0.0
        }
    }
}

/// Per-factor values and the weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Capability factor.
    pub capability: f64,
    /// Load factor.
    pub load: f64,
    /// Performance factor.
    pub performance: f64,
    /// Preference factor.
    pub preference: f64,
    /// Category factor.
    pub category: f64,
    /// Weighted average of the factors, in `[0, 1]`.
    pub total: f64,
}

/// Performance factor for agents with no history for the task type.
pub const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Capability factor: mean over the wanted tags of the best match offered.
pub fn capability_factor(
    task: &Task,
    agent: &AgentSnapshot,
    similarity: &dyn CapabilitySimilarity,
) -> f64 {
    let mut wanted: Vec<&str> = vec![task.task_type.as_str()];
    for tag in &task.required_capabilities {
        if !wanted.contains(&tag.as_str()) {
            wanted.push(tag);
        }
    }
    let total: f64 = wanted
        .iter()
        .map(|tag| {
            agent
                .agent
                .capabilities
                .iter()
                .map(|offered| similarity.similarity(tag, offered))
                .fold(0.0, f64::max)
        })
        .sum();
    total / wanted.len() as f64
}

/// Weighted suitability of `agent` for `task`.
pub fn score(
    task: &Task,
    agent: &AgentSnapshot,
    weights: &ScoringWeights,
    similarity: &dyn CapabilitySimilarity,
) -> ScoreBreakdown {
    let capability = capability_factor(task, agent, similarity);
    let load = 1.0 - agent.utilisation().clamp(0.0, 1.0);
    let performance = agent
        .performance(&task.task_type)
        .map_or(NEUTRAL_PERFORMANCE, |stats| stats.success_rate);
    let preference = if agent.agent.preferences.iter().any(|p| *p == task.task_type) {
        1.0
    } else {
        0.0
    };
    let category = match (&task.preferred_category, &agent.agent.category) {
        (Some(wanted), Some(actual)) if wanted == actual => 1.0,
        _ => 0.5,
    };

    let sum = weights.sum();
    let total = if sum > 0.0 {
        (weights.capability * capability
            + weights.load * load
            + weights.performance * performance
            + weights.preference * preference
            + weights.category * category)
            / sum
    } else {
        0.0
    };

    ScoreBreakdown {
        capability,
        load,
        performance,
        preference,
        category,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Agent;

    fn snapshot(agent: Agent, active: usize) -> AgentSnapshot {
        AgentSnapshot {
            agent,
            sequence: 0,
            active_tasks: active,
            stats: HashMap::new(),
        }
    }

    #[test]
    fn test_tag_similarity() {
        let sim = TagSimilarity::default().with_related("search", "lookup");
        assert_eq!(sim.similarity("search", "search"), 1.0);
        assert_eq!(sim.similarity("search", "lookup"), 0.5);
        assert_eq!(sim.similarity("lookup", "search"), 0.5);
        assert_eq!(sim.similarity("search.web", "search.news"), 0.5);
        assert_eq!(sim.similarity("search", "search.web"), 0.5);
        assert_eq!(sim.similarity("search", "summarize"), 0.0);
    }

    #[test]
    fn test_fresh_idle_exact_match_scores() {
        let task = Task::new("t", "search");
        let agent = snapshot(Agent::new("a", 2).with_capabilities(["search"]), 0);
        let s = score(&task, &agent, &ScoringWeights::default(), &TagSimilarity::default());
        assert_eq!(s.capability, 1.0);
        assert_eq!(s.load, 1.0);
        assert_eq!(s.performance, NEUTRAL_PERFORMANCE);
        assert_eq!(s.preference, 0.0);
        assert_eq!(s.category, 0.5);
        // 0.4 + 0.2 + 0.1 + 0.0 + 0.05
        assert!((s.total - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_capability_factor_averages_wanted_tags() {
        let task = Task::new("t", "search").with_required_capabilities(["summarize", "search"]);
        let agent = snapshot(Agent::new("a", 1).with_capabilities(["search"]), 0);
        let factor = capability_factor(&task, &agent, &TagSimilarity::default());
        assert!((factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_load_preference_and_category() {
        let task = Task::new("t", "summarize").with_preferred_category("llm");
        let agent = snapshot(
            Agent::new("a", 4)
                .with_capabilities(["summarize"])
                .with_preferences(["summarize"])
                .with_category("llm"),
            3,
        );
        let s = score(&task, &agent, &ScoringWeights::default(), &TagSimilarity::default());
        assert!((s.load - 0.25).abs() < 1e-9);
        assert_eq!(s.preference, 1.0);
        assert_eq!(s.category, 1.0);
    }

    #[test]
    fn test_performance_history_is_used() {
        let task = Task::new("t", "search");
        let mut agent = snapshot(Agent::new("a", 1).with_capabilities(["search"]), 0);
        agent.stats.insert(
            "search".into(),
            crate::registry::PerformanceStats {
                samples: 3,
                success_rate: 0.9,
                mean_latency_ms: 12.0,
            },
        );
        let s = score(&task, &agent, &ScoringWeights::default(), &TagSimilarity::default());
        assert_eq!(s.performance, 0.9);
    }

    #[test]
    fn test_score_is_deterministic() {
        let task = Task::new("t", "search.web");
        let agent = snapshot(Agent::new("a", 3).with_capabilities(["search.news"]), 1);
        let weights = ScoringWeights::default();
        let sim = TagSimilarity::default();
        assert_eq!(score(&task, &agent, &weights, &sim), score(&task, &agent, &weights, &sim));
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        let negative = ScoringWeights {
            load: -0.1,
            ..ScoringWeights::default()
        };
        assert!(negative.validate().is_err());
        let zero = ScoringWeights {
            capability: 0.0,
            load: 0.0,
            performance: 0.0,
            preference: 0.0,
            category: 0.0,
        };
        assert!(zero.validate().is_err());
    }
}
