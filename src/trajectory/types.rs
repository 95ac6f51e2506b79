//! Core experience types: states, actions, real and imagined transitions, and
//! the per-episode trajectory the trainer builds while collecting.
//!
//! [`RealTransition`] can only be assembled inside the crate, from an actual
//! environment step or from a [`StoredTransition`] the crate wrote itself.
//! World-model rollouts produce [`ImaginedTransition`]s, which the replay
//! buffer and the world model's `fit` do not accept.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RlrError};
use crate::training::advantage::discounted_returns;

// ---------------------------------------------------------------------------
// State and action
// ---------------------------------------------------------------------------

/// A reasoning context: the problem statement plus the trace so far.
///
/// States are values; [`State::advance`] returns a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State {
    pub problem: String,
    pub trace: Vec<String>,
}

impl State {
    pub fn new(problem: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            trace: Vec::new(),
        }
    }

    /// The state reached by appending `action` to the reasoning trace.
    pub fn advance(&self, action: &Action) -> Self {
        let mut trace = self.trace.clone();
        trace.push(action.as_str().to_string());
        Self {
            problem: self.problem.clone(),
            trace,
        }
    }

    /// Number of reasoning steps taken so far.
    pub fn depth(&self) -> usize {
        self.trace.len()
    }

    /// Canonical text form, also used as a lookup key.
    pub fn render(&self) -> String {
        let mut out = format!("Problem: {}", self.problem);
        for (i, step) in self.trace.iter().enumerate() {
            out.push_str(&format!("\nStep {}: {}", i + 1, step));
        }
        out
    }
}

/// One reasoning step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Real transitions
// ---------------------------------------------------------------------------

/// A transition observed in the real environment.
///
/// This is the only record type the replay buffer stores and the world model
/// fits on. It serializes but does not deserialize; snapshots read back
/// through [`StoredTransition`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealTransition {
    pub(crate) episode_id: String,
    pub(crate) state: State,
    pub(crate) action: Action,
    pub(crate) reward: f64,
    pub(crate) next_state: State,
    pub(crate) done: bool,
    pub(crate) step_index: usize,
    /// Candidate set the acting policy chose from.
    pub(crate) candidates: Vec<Action>,
    /// `log pi_behavior(action | state)` at collection time.
    pub(crate) behavior_log_prob: f64,
    /// Backed-up value when the action came from the planner.
    pub(crate) planner_value: Option<f64>,
    /// Discounted return from this step to episode end, once known.
    pub(crate) return_to_go: Option<f64>,
    /// Environment `info` for this step.
    pub(crate) metadata: serde_json::Value,
}

impl RealTransition {
    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn reward(&self) -> f64 {
        self.reward
    }

    pub fn next_state(&self) -> &State {
        &self.next_state
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn candidates(&self) -> &[Action] {
        &self.candidates
    }

    pub fn behavior_log_prob(&self) -> f64 {
        self.behavior_log_prob
    }

    pub fn planner_value(&self) -> Option<f64> {
        self.planner_value
    }

    pub fn return_to_go(&self) -> Option<f64> {
        self.return_to_go
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }
}

/// A [`RealTransition`] as written to a snapshot.
///
/// Readable from disk by anyone, but only the crate can turn it back into a
/// transition the buffer accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransition {
    episode_id: String,
    state: State,
    action: Action,
    reward: f64,
    next_state: State,
    done: bool,
    step_index: usize,
    candidates: Vec<Action>,
    behavior_log_prob: f64,
    planner_value: Option<f64>,
    return_to_go: Option<f64>,
    metadata: serde_json::Value,
}

impl StoredTransition {
    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn reward(&self) -> f64 {
        self.reward
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub(crate) fn into_transition(self) -> RealTransition {
        RealTransition {
            episode_id: self.episode_id,
            state: self.state,
            action: self.action,
            reward: self.reward,
            next_state: self.next_state,
            done: self.done,
            step_index: self.step_index,
            candidates: self.candidates,
            behavior_log_prob: self.behavior_log_prob,
            planner_value: self.planner_value,
            return_to_go: self.return_to_go,
            metadata: self.metadata,
        }
    }
}

impl From<&RealTransition> for StoredTransition {
    fn from(t: &RealTransition) -> Self {
        Self {
            episode_id: t.episode_id.clone(),
            state: t.state.clone(),
            action: t.action.clone(),
            reward: t.reward,
            next_state: t.next_state.clone(),
            done: t.done,
            step_index: t.step_index,
            candidates: t.candidates.clone(),
            behavior_log_prob: t.behavior_log_prob,
            planner_value: t.planner_value,
            return_to_go: t.return_to_go,
            metadata: t.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Imagined transitions
// ---------------------------------------------------------------------------

/// A transition simulated through the world model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImaginedTransition {
    pub state: State,
    pub action: Action,
    /// Predicted reward.
    pub reward: f64,
    pub next_state: State,
    pub done_probability: f64,
    /// Cumulative model confidence along the rollout up to this step.
    pub confidence: f64,
    /// Depth below the real state the rollout started from.
    pub depth: usize,
    pub candidates: Vec<Action>,
    pub behavior_log_prob: f64,
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// One episode under construction.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    /// Unique identifier (UUID v4), shared by all transitions.
    pub id: String,
    transitions: Vec<RealTransition>,
    /// Sum of undiscounted rewards.
    pub total_reward: f64,
    /// Whether the episode was cut short by a failed step.
    pub aborted: bool,
}

impl Trajectory {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transitions: Vec::new(),
            total_reward: 0.0,
            aborted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn transitions(&self) -> &[RealTransition] {
        &self.transitions
    }

    /// Whether the last recorded transition ended the episode.
    pub fn is_terminal(&self) -> bool {
        self.transitions.last().is_some_and(|t| t.done)
    }

    /// Record the outcome of one real environment step.
    ///
    /// Steps must chain: `state` has to equal the previous `next_state`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &mut self,
        state: State,
        action: Action,
        reward: f64,
        next_state: State,
        done: bool,
        candidates: Vec<Action>,
        behavior_log_prob: f64,
        planner_value: Option<f64>,
        metadata: serde_json::Value,
    ) -> Result<&RealTransition> {
        if let Some(last) = self.transitions.last() {
            if last.done {
                return Err(RlrError::ContractViolation(format!(
                    "trajectory {} already terminated",
                    self.id
                )));
            }
            if last.next_state != state {
                return Err(RlrError::ContractViolation(format!(
                    "trajectory {} step {} does not continue from the previous next_state",
                    self.id,
                    self.transitions.len()
                )));
            }
        }

        let step_index = self.transitions.len();
        self.total_reward += reward;
        self.transitions.push(RealTransition {
            episode_id: self.id.clone(),
            state,
            action,
            reward,
            next_state,
            done,
            step_index,
            candidates,
            behavior_log_prob,
            planner_value,
            return_to_go: None,
            metadata,
        });
        Ok(&self.transitions[step_index])
    }

    /// Close the episode and return its transitions with `return_to_go` filled.
    pub fn finalize(self, gamma: f64) -> Vec<RealTransition> {
        let rewards: Vec<f64> = self.transitions.iter().map(|t| t.reward).collect();
        let returns = discounted_returns(&rewards, gamma);
        self.transitions
            .into_iter()
            .zip(returns)
            .map(|(mut t, g)| {
                t.return_to_go = Some(g);
                t
            })
            .collect()
    }
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A standalone real transition for buffer and model tests.
    pub fn transition(problem: &str, action: &str, reward: f64, done: bool) -> RealTransition {
        let state = State::new(problem);
        let action = Action::new(action);
        let next_state = state.advance(&action);
        RealTransition {
            episode_id: "fixture".into(),
            state,
            action: action.clone(),
            reward,
            next_state,
            done,
            step_index: 0,
            candidates: vec![action],
            behavior_log_prob: 0.0,
            planner_value: None,
            return_to_go: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(traj: &mut Trajectory, state: &State, action: &str, reward: f64, done: bool) -> State {
        let action = Action::new(action);
        let next = state.advance(&action);
        traj.record(
            state.clone(),
            action.clone(),
            reward,
            next.clone(),
            done,
            vec![action],
            -0.5,
            None,
            serde_json::Value::Null,
        )
        .unwrap();
        next
    }

    #[test]
    fn advance_returns_new_state() {
        let s0 = State::new("2 + 3");
        let s1 = s0.advance(&Action::new("compute"));
        assert!(s0.trace.is_empty());
        assert_eq!(s1.trace, vec!["compute".to_string()]);
        assert_eq!(s1.depth(), 1);
        assert!(s1.render().contains("Step 1: compute"));
    }

    #[test]
    fn trajectory_chains_and_finalizes_returns() {
        let mut traj = Trajectory::new();
        let s0 = State::new("2 + 3");
        let s1 = step(&mut traj, &s0, "a", 0.0, false);
        let s2 = step(&mut traj, &s1, "b", 0.0, false);
        step(&mut traj, &s2, "c", 1.0, true);
        assert!(traj.is_terminal());
        assert!((traj.total_reward - 1.0).abs() < 1e-12);

        let id = traj.id.clone();
        let stored = traj.finalize(0.5);
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|t| t.episode_id() == id));
        assert!((stored[0].return_to_go().unwrap() - 0.25).abs() < 1e-12);
        assert!((stored[1].return_to_go().unwrap() - 0.5).abs() < 1e-12);
        assert!((stored[2].return_to_go().unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(stored[1].next_state(), stored[2].state());
    }

    #[test]
    fn broken_chain_is_a_contract_violation() {
        let mut traj = Trajectory::new();
        let s0 = State::new("p");
        step(&mut traj, &s0, "a", 0.0, false);
        let unrelated = State::new("other");
        let action = Action::new("b");
        let err = traj
            .record(
                unrelated.clone(),
                action.clone(),
                0.0,
                unrelated.advance(&action),
                false,
                vec![action],
                0.0,
                None,
                serde_json::Value::Null,
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn stored_form_reads_back_what_a_transition_writes() {
        let mut traj = Trajectory::new();
        let s0 = State::new("2 + 3");
        step(&mut traj, &s0, "compute", 1.0, true);
        let mut original = traj.finalize(0.9).remove(0);
        original.planner_value = Some(0.4);
        original.metadata = serde_json::json!({ "error": "step timed out after 5 ms" });

        let json = serde_json::to_string(&original).unwrap();
        let stored: StoredTransition = serde_json::from_str(&json).unwrap();
        assert_eq!(stored.episode_id(), original.episode_id());
        assert!(stored.done());
        assert_eq!(stored, StoredTransition::from(&original));
        assert_eq!(stored.into_transition(), original);
    }

    #[test]
    fn cannot_record_after_terminal() {
        let mut traj = Trajectory::new();
        let s0 = State::new("p");
        let s1 = step(&mut traj, &s0, "a", 1.0, true);
        let action = Action::new("b");
        let result = traj.record(
            s1.clone(),
            action.clone(),
            0.0,
            s1.advance(&action),
            false,
            vec![action],
            0.0,
            None,
            serde_json::Value::Null,
        );
        assert!(result.is_err());
    }
}
