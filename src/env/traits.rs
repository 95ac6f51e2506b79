//! Core environment trait and shared types.
//!
//! Every reasoning environment (HTTP task server, scripted mock) implements
//! the [`Environment`] trait so that the trainer can drive episodes uniformly.

use serde::{Deserialize, Serialize};

use crate::trajectory::types::{Action, State};

/// Info key set to `true` when the environment rejected an action.
pub const INVALID_ACTION_KEY: &str = "invalid_action";

/// Result of one environment step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// The reasoning context after the step.
    pub state: State,
    /// Scalar reward for the step. Invalid actions carry a penalty here.
    pub reward: f64,
    /// Whether the episode has terminated (success, failure or truncation).
    pub done: bool,
    /// Arbitrary extra information from the environment.
    pub info: serde_json::Value,
}

impl StepOutcome {
    /// Whether the environment flagged the action as invalid.
    pub fn is_invalid(&self) -> bool {
        self.info
            .get(INVALID_ACTION_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// The core environment trait.
///
/// Errors are collaborator failures (`anyhow`); the trainer converts a failed
/// step into an early episode end and a failed reset into a skipped episode.
#[allow(async_fn_in_trait)]
pub trait Environment: Send + Sync {
    /// Start a new episode and return its initial state.
    async fn reset(&mut self) -> anyhow::Result<State>;

    /// Apply a reasoning step.
    async fn step(&mut self, action: &Action) -> anyhow::Result<StepOutcome>;

    /// The maximum number of steps allowed in an episode.
    fn max_steps(&self) -> usize;

    /// Whether the current episode has ended.
    fn is_done(&self) -> bool;
}
