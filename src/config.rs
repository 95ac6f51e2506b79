use serde::{Deserialize, Serialize};

use crate::error::{Result, RlrError};

/// Complete configuration for a training run.
///
/// Read once when the trainer is built; changing it mid-run is not supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

/// When collected transitions are pushed into the replay buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Flush the whole trajectory at episode end (returns are known).
    Episode,
    /// Insert every transition as soon as it is observed.
    Step,
}

/// Resource cap for a single planner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanningBudget {
    /// Maximum simulated depth below a root candidate.
    pub max_depth: usize,
    /// Maximum number of world-model queries for the whole search.
    pub max_nodes: usize,
    /// Optional wall-clock limit in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for PlanningBudget {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_nodes: 32,
            deadline_ms: None,
        }
    }
}

/// Loop scheduling, replay and credit-assignment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Replay buffer capacity (default: 10000).
    pub buffer_capacity: usize,
    /// Batch size for fit and update phases (default: 32).
    pub sample_batch_size: usize,
    /// Fit the world model every N collected transitions (default: 50).
    pub fit_interval: usize,
    /// Update the policy every N collected transitions (default: 100).
    pub update_interval: usize,
    pub planning_budget: PlanningBudget,
    /// Discount factor gamma (default: 0.99).
    pub discount_factor: f64,
    /// Softmax temperature for stochastic acting (default: 1.0).
    pub exploration_temperature: f64,
    /// Sample by model-error priority instead of uniformly (default: false).
    pub prioritized_replay: bool,
    /// Priority exponent alpha for prioritized replay (default: 0.6).
    pub priority_alpha: f64,
    /// Route action selection through the planner (default: false).
    pub use_planning: bool,
    /// Plan every k-th step of an episode when planning is enabled (default: 1).
    pub planning_interval: usize,
    pub store_mode: StoreMode,
    /// Hard cap on steps per episode (default: 32).
    pub max_episode_steps: usize,
    /// Penalty applied when a step fails and the episode is cut (default: 0.1).
    pub invalid_action_penalty: f64,
    /// Number of imagined rollouts added to each policy update (default: 0).
    pub imagined_rollouts: usize,
    /// Length of each imagined rollout (default: 3).
    pub imagination_horizon: usize,
    /// Weight of planner value estimates in value targets (default: 0.5).
    pub plan_target_weight: f64,
    /// World model loss ceiling for divergence detection (default: 1000).
    pub divergence_ceiling: f64,
    /// Consecutive fits above the ceiling before divergence is raised (default: 3).
    pub divergence_patience: usize,
    /// Treat divergence as fatal instead of a warning (default: false).
    pub strict_divergence: bool,
    pub step_timeout_ms: u64,
    pub fit_timeout_ms: u64,
    pub update_timeout_ms: u64,
    pub plan_timeout_ms: u64,
    /// Seed for every random stream in the run (default: 0).
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            sample_batch_size: 32,
            fit_interval: 50,
            update_interval: 100,
            planning_budget: PlanningBudget::default(),
            discount_factor: 0.99,
            exploration_temperature: 1.0,
            prioritized_replay: false,
            priority_alpha: 0.6,
            use_planning: false,
            planning_interval: 1,
            store_mode: StoreMode::Episode,
            max_episode_steps: 32,
            invalid_action_penalty: 0.1,
            imagined_rollouts: 0,
            imagination_horizon: 3,
            plan_target_weight: 0.5,
            divergence_ceiling: 1e3,
            divergence_patience: 3,
            strict_divergence: false,
            step_timeout_ms: 30_000,
            fit_timeout_ms: 60_000,
            update_timeout_ms: 60_000,
            plan_timeout_ms: 30_000,
            seed: 0,
        }
    }
}

/// Learned-component hyperparameters and backbone endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hashed feature dimension shared by world model and policy (default: 256).
    pub feature_dim: usize,
    pub world_model_learning_rate: f64,
    /// Gradient epochs per world model fit call (default: 8).
    pub fit_epochs: usize,
    /// Distinct (state, action) pairs the world model remembers (default: 4096).
    pub memory_capacity: usize,
    pub policy_learning_rate: f64,
    /// PPO clipping epsilon for the off-policy ratio (default: 0.2).
    pub clip_epsilon: f64,
    /// Weight of the value loss in the policy objective (default: 0.5).
    pub value_coeff: f64,
    /// Candidate actions requested from the backbone per state (default: 4).
    pub num_candidates: usize,
    /// Simulated done probability that stops a rollout (default: 0.9).
    pub done_threshold: f64,
    /// Confidence scale for (state, action) pairs never observed (default: 0.25).
    pub unseen_confidence: f64,
    /// Gumbel noise scale applied to planner candidate ranking (default: 0.0).
    pub planner_noise: f64,
    /// Base URL for the backbone chat API.
    pub backbone_api_base: String,
    /// Model identifier for the backbone (e.g. "Qwen/Qwen2.5-7B-Instruct").
    pub backbone_model_id: String,
    /// API key for the backbone.
    pub backbone_api_key: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_dim: 256,
            world_model_learning_rate: 0.05,
            fit_epochs: 8,
            memory_capacity: 4096,
            policy_learning_rate: 0.05,
            clip_epsilon: 0.2,
            value_coeff: 0.5,
            num_candidates: 4,
            done_threshold: 0.9,
            unseen_confidence: 0.25,
            planner_noise: 0.0,
            backbone_api_base: "http://localhost:8000/v1".into(),
            backbone_model_id: "Qwen/Qwen2.5-7B-Instruct".into(),
            backbone_api_key: String::new(),
        }
    }
}

/// Logging and telemetry output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is not set (default: "info").
    pub filter: String,
    /// Where to stream telemetry records as JSON lines, if anywhere.
    pub telemetry_path: Option<std::path::PathBuf>,
    /// Telemetry records kept in memory during a run (default: 4096).
    pub telemetry_retain: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            telemetry_path: None,
            telemetry_retain: 4096,
        }
    }
}

impl Config {
    /// Reject settings the loop cannot honour.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        let m = &self.model;

        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(RlrError::ContractViolation(format!("invalid config: {what}")))
            }
        };

        check(t.buffer_capacity > 0, "buffer_capacity must be positive")?;
        check(t.sample_batch_size > 0, "sample_batch_size must be positive")?;
        check(
            t.sample_batch_size <= t.buffer_capacity,
            "sample_batch_size exceeds buffer_capacity",
        )?;
        check(t.fit_interval > 0, "fit_interval must be positive")?;
        check(t.update_interval > 0, "update_interval must be positive")?;
        check(t.planning_interval > 0, "planning_interval must be positive")?;
        check(
            (0.0..=1.0).contains(&t.discount_factor),
            "discount_factor must be in [0, 1]",
        )?;
        check(
            t.exploration_temperature > 0.0,
            "exploration_temperature must be positive",
        )?;
        check(t.priority_alpha >= 0.0, "priority_alpha must be non-negative")?;
        check(t.max_episode_steps > 0, "max_episode_steps must be positive")?;
        check(
            (0.0..=1.0).contains(&t.plan_target_weight),
            "plan_target_weight must be in [0, 1]",
        )?;
        check(m.feature_dim > 0, "feature_dim must be positive")?;
        check(m.memory_capacity > 0, "memory_capacity must be positive")?;
        check(m.num_candidates > 0, "num_candidates must be positive")?;
        check(
            (0.0..=1.0).contains(&m.done_threshold),
            "done_threshold must be in [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&m.unseen_confidence),
            "unseen_confidence must be in [0, 1]",
        )?;
        check(m.clip_epsilon >= 0.0, "clip_epsilon must be non-negative")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = Config::default();
        config.training.buffer_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn batch_larger_than_capacity_is_rejected() {
        let mut config = Config::default();
        config.training.buffer_capacity = 8;
        config.training.sample_batch_size = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_memory_capacity_is_rejected() {
        let mut config = Config::default();
        config.model.memory_capacity = 0;
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "training": { "buffer_capacity": 200, "prioritized_replay": true } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.buffer_capacity, 200);
        assert!(config.training.prioritized_replay);
        assert_eq!(config.training.sample_batch_size, 32);
        assert_eq!(config.model.feature_dim, 256);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn store_mode_uses_snake_case() {
        let json = r#"{ "training": { "store_mode": "step" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.store_mode, StoreMode::Step);
    }
}
