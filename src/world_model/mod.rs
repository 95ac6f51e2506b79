//! Learned environment dynamics.
//!
//! A [`WorldModel`] maps (state, action) to a predicted next state, reward and
//! termination probability, together with a confidence the planner uses to
//! discount deep rollouts. Fitting accepts real transitions only.

pub mod learned;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trajectory::types::{Action, RealTransition, State};

pub use learned::{LearnedWorldModel, WorldModelSnapshot};

/// One query result. Never stored; training targets come from real data.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldModelPrediction {
    pub next_state_estimate: State,
    pub reward_estimate: f64,
    pub done_probability: f64,
    /// In [0, 1]. Low for unseen pairs and when recent fit error is high.
    pub confidence: f64,
}

/// Summary of one `fit` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitStats {
    /// Training loss after the last epoch.
    pub loss: f64,
    /// Mean of `|r_hat - r| + state divergence` over the batch, measured
    /// before this call's parameter update.
    pub prediction_error: f64,
    pub reward_error: f64,
    pub done_error: f64,
    pub state_divergence: f64,
    pub samples: usize,
    /// Per-sample prediction errors in batch order (priority feedback).
    #[serde(skip)]
    pub sample_errors: Vec<f64>,
}

/// Running predictive-error estimates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub reward_error_ema: f64,
    pub done_error_ema: f64,
    pub state_divergence_ema: f64,
    /// Number of non-empty fits folded into the averages.
    pub fits: u64,
}

#[allow(async_fn_in_trait)]
pub trait WorldModel: Send + Sync {
    type Snapshot: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Predict the outcome of `action` in `state`. Pure given parameters.
    async fn predict(&self, state: &State, action: &Action) -> Result<WorldModelPrediction>;

    /// Fit on a batch of real transitions. The only mutator.
    ///
    /// An empty batch is a no-op that returns zeroed stats.
    async fn fit(&mut self, batch: &[Arc<RealTransition>]) -> Result<FitStats>;

    fn reset_stats(&mut self);

    fn error_stats(&self) -> ErrorStats;

    fn export_state(&self) -> Self::Snapshot;

    fn import_state(&mut self, snapshot: Self::Snapshot) -> Result<()>;
}
