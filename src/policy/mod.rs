//! Reasoning policies.
//!
//! A [`Policy`] maps a state to a distribution over candidate reasoning steps
//! and estimates the state's value. Candidate steps come from a
//! [`backbone::Backbone`]; the policy itself only learns how to rank them.

pub mod backbone;
pub mod reasoning;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trajectory::types::{Action, ImaginedTransition, RealTransition, State};

pub use backbone::{AnyBackbone, Backbone, LlmBackbone, ScriptedBackbone};
pub use reasoning::{PolicySnapshot, ReasoningPolicy};

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// A stochastic action choice.
#[derive(Debug, Clone, PartialEq)]
pub struct ActSample {
    pub action: Action,
    /// `log pi(action | state)` under the acting distribution.
    pub log_prob: f64,
    pub candidates: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAction {
    pub action: Action,
    pub probability: f64,
}

/// Deterministic view of the policy at one state.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvaluation {
    /// Candidates with probabilities, in backbone order. Sums to 1.
    pub distribution: Vec<ScoredAction>,
    pub value: f64,
}

impl PolicyEvaluation {
    /// Most probable candidate; the first one wins ties.
    pub fn greedy(&self) -> Option<&ScoredAction> {
        self.distribution.iter().fold(None, |best, c| match best {
            Some(b) if b.probability >= c.probability => Some(b),
            _ => Some(c),
        })
    }

    pub fn candidates(&self) -> Vec<Action> {
        self.distribution.iter().map(|c| c.action.clone()).collect()
    }
}

/// One update sample, built from a real or an imagined transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub state: State,
    pub action: Action,
    pub candidates: Vec<Action>,
    pub behavior_log_prob: f64,
    /// Relative weight in the batch average (model confidence for imagined data).
    pub weight: f64,
}

impl TrainingSample {
    pub fn from_real(t: &RealTransition) -> Self {
        Self {
            state: t.state().clone(),
            action: t.action().clone(),
            candidates: t.candidates().to_vec(),
            behavior_log_prob: t.behavior_log_prob(),
            weight: 1.0,
        }
    }

    pub fn from_imagined(t: &ImaginedTransition) -> Self {
        Self {
            state: t.state.clone(),
            action: t.action.clone(),
            candidates: t.candidates.clone(),
            behavior_log_prob: t.behavior_log_prob,
            weight: t.confidence.clamp(0.0, 1.0),
        }
    }
}

/// Regression target for a sample's state value. The advantage is the
/// target minus the current value estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyTarget {
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub loss: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    /// Mean importance ratio between current and behaviour policy.
    pub mean_ratio: f64,
    /// Fraction of samples whose ratio fell outside the clip band.
    pub clip_fraction: f64,
    pub samples: usize,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[allow(async_fn_in_trait)]
pub trait Policy: Send + Sync {
    type Snapshot: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Sample an action at the exploration temperature.
    async fn act(&mut self, state: &State) -> Result<ActSample>;

    /// Candidate distribution and value estimate. Deterministic given parameters.
    async fn evaluate(&self, state: &State) -> Result<PolicyEvaluation>;

    /// Value estimate alone; no backbone call.
    fn state_value(&self, state: &State) -> f64;

    /// `log pi(action | state)` under the acting distribution over `candidates`.
    fn log_prob(&self, state: &State, candidates: &[Action], action: &Action) -> f64;

    /// One gradient step on the whole batch. `targets[i]` belongs to `batch[i]`.
    async fn update(
        &mut self,
        batch: &[TrainingSample],
        targets: &[PolicyTarget],
    ) -> Result<UpdateStats>;

    fn export_state(&self) -> Self::Snapshot;

    fn import_state(&mut self, snapshot: Self::Snapshot) -> Result<()>;
}
