//! Lookahead action selection through a learned world model.

pub mod simple;

use crate::config::PlanningBudget;
use crate::error::Result;
use crate::policy::Policy;
use crate::trajectory::types::{Action, State};
use crate::world_model::WorldModel;

pub use simple::SimplePlanner;

/// The planner's choice for one real state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub action: Action,
    /// Backed-up discounted value of the chosen branch, or the policy value
    /// when no lookahead happened.
    pub value_estimate: f64,
    /// 0 when the planner fell back to the policy's greedy action.
    pub rollout_depth_reached: usize,
    /// Product of model confidences along the chosen rollout.
    pub confidence: f64,
    /// World-model queries spent.
    pub nodes_expanded: usize,
    /// Full candidate set the policy proposed at the root.
    pub candidates: Vec<Action>,
    /// `log pi(action | state)` under the acting policy.
    pub log_prob: f64,
}

#[allow(async_fn_in_trait)]
pub trait Planner: Send + Sync {
    /// Pick an action for `state`. Always returns a candidate of the policy;
    /// only a failure to obtain candidates at the root is an error.
    async fn plan<W: WorldModel, P: Policy>(
        &mut self,
        state: &State,
        world_model: &W,
        policy: &P,
        budget: &PlanningBudget,
    ) -> Result<PlannedAction>;
}
