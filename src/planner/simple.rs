//! Breadth-first shallow rollout planner.
//!
//! EXPAND the root into the policy's top candidates, SIMULATE every branch one
//! depth level at a time through the world model (so a small node budget is
//! shared evenly), BACKUP confidence-weighted discounted rewards with a policy
//! value bootstrap at the leaf, then SELECT the best branch.

use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PlannedAction, Planner};
use crate::config::{Config, PlanningBudget};
use crate::error::{Result, RlrError};
use crate::policy::{Policy, PolicyEvaluation};
use crate::trajectory::types::{Action, State};
use crate::world_model::WorldModel;

#[derive(Debug, Clone)]
struct Branch {
    action: Action,
    state: State,
    value: f64,
    /// Product of model confidences so far.
    confidence: f64,
    root_confidence: f64,
    depth: usize,
    terminal: bool,
    pruned: bool,
}

impl Branch {
    fn open(&self) -> bool {
        !self.terminal && !self.pruned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimplePlanner {
    discount: f64,
    done_threshold: f64,
    num_candidates: usize,
    /// Scale of Gumbel noise added to candidate log-probabilities.
    noise: f64,
    rng: ChaCha8Rng,
}

impl SimplePlanner {
    pub fn new(discount: f64, done_threshold: f64, num_candidates: usize, noise: f64, seed: u64) -> Self {
        Self {
            discount,
            done_threshold,
            num_candidates: num_candidates.max(1),
            noise: noise.max(0.0),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.training.discount_factor,
            config.model.done_threshold,
            config.model.num_candidates,
            config.model.planner_noise,
            config.training.seed.wrapping_add(2),
        )
    }

    fn gumbel(&mut self) -> f64 {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        -(-u.ln()).ln()
    }

    /// Root candidates ranked by (noisy) policy log-probability.
    fn expand(&mut self, eval: &PolicyEvaluation) -> Vec<Action> {
        let mut ranked: Vec<(f64, usize, Action)> = eval
            .distribution
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let noise = if self.noise > 0.0 { self.noise * self.gumbel() } else { 0.0 };
                (c.probability.max(f64::MIN_POSITIVE).ln() + noise, i, c.action.clone())
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(self.num_candidates)
            .map(|(_, _, a)| a)
            .collect()
    }
}

impl Planner for SimplePlanner {
    async fn plan<W: WorldModel, P: Policy>(
        &mut self,
        state: &State,
        world_model: &W,
        policy: &P,
        budget: &PlanningBudget,
    ) -> Result<PlannedAction> {
        let started = Instant::now();
        let deadline = budget.deadline_ms.map(Duration::from_millis);
        let out_of_time = || deadline.is_some_and(|d| started.elapsed() >= d);

        let root = policy.evaluate(state).await?;
        let candidates = root.candidates();
        let greedy = root
            .greedy()
            .map(|c| c.action.clone())
            .ok_or_else(|| RlrError::ContractViolation("policy evaluated no candidates".into()))?;

        let fallback = |nodes: usize| PlannedAction {
            log_prob: policy.log_prob(state, &candidates, &greedy),
            action: greedy.clone(),
            value_estimate: root.value,
            rollout_depth_reached: 0,
            confidence: 0.0,
            nodes_expanded: nodes,
            candidates: candidates.clone(),
        };

        if budget.max_nodes == 0 || budget.max_depth == 0 {
            return Ok(fallback(0));
        }

        let mut branches: Vec<Branch> = self
            .expand(&root)
            .into_iter()
            .map(|action| Branch {
                action,
                state: state.clone(),
                value: 0.0,
                confidence: 1.0,
                root_confidence: 0.0,
                depth: 0,
                terminal: false,
                pruned: false,
            })
            .collect();

        let mut nodes = 0usize;
        'levels: for depth in 0..budget.max_depth {
            for branch in branches.iter_mut().filter(|b| b.open()) {
                if nodes >= budget.max_nodes || out_of_time() {
                    break 'levels;
                }

                let action = if depth == 0 {
                    branch.action.clone()
                } else {
                    match policy.evaluate(&branch.state).await {
                        Ok(eval) => match eval.greedy() {
                            Some(c) => c.action.clone(),
                            None => {
                                branch.pruned = true;
                                continue;
                            }
                        },
                        Err(err) => {
                            debug!(error = %err, "planner branch pruned: policy failed");
                            branch.pruned = true;
                            continue;
                        }
                    }
                };

                nodes += 1;
                let prediction = match world_model.predict(&branch.state, &action).await {
                    Ok(p) => p,
                    Err(err) => {
                        debug!(error = %err, "planner branch pruned: model failed");
                        branch.pruned = true;
                        continue;
                    }
                };

                branch.confidence *= prediction.confidence;
                if depth == 0 {
                    branch.root_confidence = prediction.confidence;
                }
                branch.value +=
                    self.discount.powi(depth as i32) * branch.confidence * prediction.reward_estimate;
                branch.state = prediction.next_state_estimate;
                branch.depth = depth + 1;
                if prediction.done_probability > self.done_threshold {
                    branch.terminal = true;
                }
            }
        }

        // Leaf bootstrap for rollouts that did not reach a predicted terminal.
        for branch in branches.iter_mut().filter(|b| !b.pruned && !b.terminal && b.depth > 0) {
            branch.value += self.discount.powi(branch.depth as i32)
                * branch.confidence
                * policy.state_value(&branch.state);
        }

        let best = branches
            .iter()
            .filter(|b| !b.pruned && b.depth > 0 && b.value.is_finite())
            .max_by_key(|b| (OrderedFloat(b.value), OrderedFloat(b.root_confidence)));

        let Some(best) = best else {
            debug!(nodes, "planner fell back to greedy policy action");
            return Ok(fallback(nodes));
        };

        debug!(
            action = %best.action,
            value = best.value,
            depth = best.depth,
            nodes,
            "planner selected action"
        );

        Ok(PlannedAction {
            action: best.action.clone(),
            value_estimate: best.value,
            rollout_depth_reached: best.depth,
            confidence: best.confidence,
            nodes_expanded: nodes,
            log_prob: policy.log_prob(state, &candidates, &best.action),
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ModelConfig;
    use crate::env::reasoning::default_problems;
    use crate::policy::{ReasoningPolicy, ScriptedBackbone};
    use crate::trajectory::types::fixtures::transition;
    use crate::world_model::{
        ErrorStats, FitStats, LearnedWorldModel, WorldModelPrediction,
    };

    struct FailingWorldModel;

    impl WorldModel for FailingWorldModel {
        type Snapshot = ();

        async fn predict(&self, _: &State, _: &Action) -> Result<WorldModelPrediction> {
            Err(RlrError::non_finite(f64::NAN))
        }

        async fn fit(&mut self, _: &[Arc<crate::trajectory::types::RealTransition>]) -> Result<FitStats> {
            Ok(FitStats::default())
        }

        fn reset_stats(&mut self) {}

        fn error_stats(&self) -> ErrorStats {
            ErrorStats::default()
        }

        fn export_state(&self) {}

        fn import_state(&mut self, _: ()) -> Result<()> {
            Ok(())
        }
    }

    fn policy() -> ReasoningPolicy<ScriptedBackbone> {
        let model = ModelConfig {
            feature_dim: 64,
            ..ModelConfig::default()
        };
        ReasoningPolicy::new(ScriptedBackbone::new(&default_problems()), &model, 1.0, 0)
    }

    fn planner() -> SimplePlanner {
        SimplePlanner::new(0.99, 0.9, 4, 0.0, 0)
    }

    fn budget(max_depth: usize, max_nodes: usize) -> PlanningBudget {
        PlanningBudget {
            max_depth,
            max_nodes,
            deadline_ms: None,
        }
    }

    /// State one step before the end of the first scripted problem.
    fn last_step_state() -> (State, Action) {
        let problem = &default_problems()[0];
        let mut s = State::new(problem.problem.clone());
        for step in &problem.steps[..2] {
            s = s.advance(&Action::new(step.as_str()));
        }
        (s, Action::new(problem.steps[2].as_str()))
    }

    #[tokio::test]
    async fn zero_node_budget_falls_back_to_greedy() {
        let p = policy();
        let wm = LearnedWorldModel::new(64, 0.1, 4, 0.25);
        let s = State::new(default_problems()[0].problem.clone());
        let plan = planner().plan(&s, &wm, &p, &budget(3, 0)).await.unwrap();

        let eval = p.evaluate(&s).await.unwrap();
        assert_eq!(plan.action, eval.greedy().unwrap().action);
        assert!(plan.candidates.contains(&plan.action));
        assert_eq!(plan.rollout_depth_reached, 0);
        assert_eq!(plan.nodes_expanded, 0);
        assert_eq!(plan.value_estimate, eval.value);
    }

    #[tokio::test]
    async fn failing_model_prunes_every_branch() {
        let p = policy();
        let s = State::new("p");
        let plan = planner()
            .plan(&s, &FailingWorldModel, &p, &budget(3, 32))
            .await
            .unwrap();
        assert_eq!(plan.rollout_depth_reached, 0);
        assert!(plan.candidates.contains(&plan.action));
        assert_eq!(plan.nodes_expanded, 4);
    }

    #[tokio::test]
    async fn picks_the_branch_the_model_rewards() {
        let p = policy();
        let (s, expected) = last_step_state();
        let candidates = p.evaluate(&s).await.unwrap().candidates();
        assert!(candidates.contains(&expected));

        let mut wm = LearnedWorldModel::new(64, 0.3, 8, 0.25);
        let batch: Vec<_> = candidates
            .iter()
            .map(|a| {
                let reward = if a == &expected { 1.0 } else { -0.1 };
                let mut t = transition(&s.problem, a.as_str(), reward, true);
                t.state = s.clone();
                t.next_state = s.advance(a);
                Arc::new(t)
            })
            .collect();
        for _ in 0..30 {
            wm.fit(&batch).await.unwrap();
        }

        let plan = planner().plan(&s, &wm, &p, &budget(2, 32)).await.unwrap();
        assert_eq!(plan.action, expected);
        assert!(plan.rollout_depth_reached >= 1);
        assert!(plan.value_estimate > 0.0);
        assert!(plan.confidence > 0.0 && plan.confidence <= 1.0);
        assert!(plan.log_prob.is_finite());
    }

    #[tokio::test]
    async fn node_budget_is_respected() {
        let p = policy();
        let wm = LearnedWorldModel::new(64, 0.1, 4, 0.25);
        let s = State::new(default_problems()[1].problem.clone());
        let plan = planner().plan(&s, &wm, &p, &budget(5, 3)).await.unwrap();
        assert!(plan.nodes_expanded <= 3);
        assert!(plan.candidates.contains(&plan.action));
        assert_eq!(plan.rollout_depth_reached, 1);
    }

    #[tokio::test]
    async fn expired_deadline_still_returns_an_action() {
        let p = policy();
        let wm = LearnedWorldModel::new(64, 0.1, 4, 0.25);
        let s = State::new(default_problems()[2].problem.clone());
        let mut b = budget(3, 32);
        b.deadline_ms = Some(0);
        let plan = planner().plan(&s, &wm, &p, &b).await.unwrap();
        assert_eq!(plan.nodes_expanded, 0);
        assert!(plan.candidates.contains(&plan.action));
    }

    #[tokio::test]
    async fn noisy_expansion_is_seeded() {
        let p = policy();
        let wm = LearnedWorldModel::new(64, 0.1, 4, 0.25);
        let s = State::new(default_problems()[0].problem.clone());
        let mut a = SimplePlanner::new(0.99, 0.9, 2, 1.0, 42);
        let mut b = SimplePlanner::new(0.99, 0.9, 2, 1.0, 42);
        for _ in 0..5 {
            let pa = a.plan(&s, &wm, &p, &budget(2, 16)).await.unwrap();
            let pb = b.plan(&s, &wm, &p, &budget(2, 16)).await.unwrap();
            assert_eq!(pa, pb);
        }
    }
}
