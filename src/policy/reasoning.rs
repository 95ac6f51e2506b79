//! Linear softmax policy over backbone-proposed reasoning steps.
//!
//!   pi(a | s)  = softmax_a( theta . phi(s, a) / T )
//!   V(s)       = w . psi(s) + b
//!
//! Updates use the clipped surrogate with importance ratio
//! `exp(log pi_theta(a|s) - behavior_log_prob)`, plus a squared value loss.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backbone::Backbone;
use super::{
    ActSample, Policy, PolicyEvaluation, PolicyTarget, ScoredAction, TrainingSample, UpdateStats,
};
use crate::config::{Config, ModelConfig};
use crate::error::{Result, RlrError};
use crate::features::{dot, Featurizer};
use crate::training::advantage::{
    clip_ratio, compute_importance_ratio, normalize_advantages, surrogate_is_active,
};
use crate::trajectory::types::{Action, State};

/// Candidate sets kept per state before the cache is flushed.
const CANDIDATE_CACHE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    preference: Vec<f64>,
    value_weights: Vec<f64>,
    value_bias: f64,
}

impl Params {
    fn zeros(dim: usize) -> Self {
        Self {
            preference: vec![0.0; dim],
            value_weights: vec![0.0; dim],
            value_bias: 0.0,
        }
    }

    fn is_finite(&self) -> bool {
        self.value_bias.is_finite()
            && self.preference.iter().all(|w| w.is_finite())
            && self.value_weights.iter().all(|w| w.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCandidates {
    pub state: State,
    pub candidates: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub feature_dim: usize,
    pub preference: Vec<f64>,
    pub value_weights: Vec<f64>,
    pub value_bias: f64,
    pub candidate_cache: Vec<CachedCandidates>,
    pub rng: ChaCha8Rng,
}

pub struct ReasoningPolicy<B> {
    backbone: B,
    featurizer: Featurizer,
    num_candidates: usize,
    temperature: f64,
    learning_rate: f64,
    clip_epsilon: f64,
    value_coeff: f64,
    params: Params,
    rng: ChaCha8Rng,
    /// Backbone proposals are sampled text; caching them per state is what
    /// makes `evaluate` deterministic.
    cache: Mutex<HashMap<State, Vec<Action>>>,
}

impl<B: Backbone> ReasoningPolicy<B> {
    pub fn new(backbone: B, model: &ModelConfig, temperature: f64, seed: u64) -> Self {
        let featurizer = Featurizer::new(model.feature_dim);
        Self {
            backbone,
            params: Params::zeros(featurizer.dim()),
            featurizer,
            num_candidates: model.num_candidates.max(1),
            temperature,
            learning_rate: model.policy_learning_rate,
            clip_epsilon: model.clip_epsilon,
            value_coeff: model.value_coeff,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(backbone: B, config: &Config) -> Self {
        Self::new(
            backbone,
            &config.model,
            config.training.exploration_temperature,
            config.training.seed.wrapping_add(1),
        )
    }

    fn cached(&self, state: &State) -> Option<Vec<Action>> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(state).cloned()
    }

    async fn candidates(&self, state: &State) -> Result<Vec<Action>> {
        if let Some(c) = self.cached(state) {
            return Ok(c);
        }
        let proposed = self
            .backbone
            .propose(state, self.num_candidates)
            .await
            .map_err(RlrError::collaborator)?;
        if proposed.is_empty() {
            return Err(RlrError::Collaborator(
                "backbone proposed no candidate steps".into(),
            ));
        }

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if cache.len() >= CANDIDATE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(state.clone(), proposed.clone());
        Ok(proposed)
    }

    fn probabilities(params: &Params, phis: &[Vec<f64>], temperature: f64) -> Vec<f64> {
        let scores: Vec<f64> = phis
            .iter()
            .map(|phi| dot(&params.preference, phi) / temperature)
            .collect();
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    fn pair_features(&self, state: &State, candidates: &[Action]) -> Vec<Vec<f64>> {
        candidates.iter().map(|a| self.featurizer.pair(state, a)).collect()
    }

    fn value_of(&self, params: &Params, state: &State) -> f64 {
        dot(&params.value_weights, &self.featurizer.state(state)) + params.value_bias
    }
}

impl<B: Backbone> Policy for ReasoningPolicy<B> {
    type Snapshot = PolicySnapshot;

    async fn act(&mut self, state: &State) -> Result<ActSample> {
        let candidates = self.candidates(state).await?;
        let phis = self.pair_features(state, &candidates);
        let probs = Self::probabilities(&self.params, &phis, self.temperature);

        let dist = WeightedIndex::new(&probs)
            .map_err(|_| RlrError::non_finite(f64::NAN))?;
        let idx = dist.sample(&mut self.rng);

        Ok(ActSample {
            action: candidates[idx].clone(),
            log_prob: probs[idx].ln(),
            candidates,
        })
    }

    async fn evaluate(&self, state: &State) -> Result<PolicyEvaluation> {
        let candidates = self.candidates(state).await?;
        let phis = self.pair_features(state, &candidates);
        let probs = Self::probabilities(&self.params, &phis, 1.0);
        Ok(PolicyEvaluation {
            distribution: candidates
                .into_iter()
                .zip(probs)
                .map(|(action, probability)| ScoredAction { action, probability })
                .collect(),
            value: self.value_of(&self.params, state),
        })
    }

    fn state_value(&self, state: &State) -> f64 {
        self.value_of(&self.params, state)
    }

    fn log_prob(&self, state: &State, candidates: &[Action], action: &Action) -> f64 {
        let Some(idx) = candidates.iter().position(|c| c == action) else {
            return f64::NEG_INFINITY;
        };
        let phis = self.pair_features(state, candidates);
        Self::probabilities(&self.params, &phis, self.temperature)[idx].ln()
    }

    async fn update(
        &mut self,
        batch: &[TrainingSample],
        targets: &[PolicyTarget],
    ) -> Result<UpdateStats> {
        if batch.len() != targets.len() {
            return Err(RlrError::ContractViolation(format!(
                "policy update got {} samples but {} targets",
                batch.len(),
                targets.len()
            )));
        }
        if batch.is_empty() {
            return Ok(UpdateStats::default());
        }

        let dim = self.featurizer.dim();
        let params = &self.params;

        let mut chosen = Vec::with_capacity(batch.len());
        for sample in batch {
            let idx = sample
                .candidates
                .iter()
                .position(|c| c == &sample.action)
                .ok_or_else(|| {
                    RlrError::ContractViolation(format!(
                        "sampled action {:?} is not among its candidates",
                        sample.action.as_str()
                    ))
                })?;
            chosen.push(idx);
        }

        let state_feats: Vec<Vec<f64>> = batch
            .iter()
            .map(|s| self.featurizer.state(&s.state))
            .collect();
        let values: Vec<f64> = state_feats
            .iter()
            .map(|x| dot(&params.value_weights, x) + params.value_bias)
            .collect();
        let raw: Vec<f64> = targets.iter().zip(&values).map(|(t, v)| t.value - v).collect();
        let advantages = normalize_advantages(&raw);

        let total_weight: f64 = batch.iter().map(|s| s.weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            return Ok(UpdateStats {
                samples: batch.len(),
                ..UpdateStats::default()
            });
        }

        let mut g_pref = vec![0.0; dim];
        let mut g_value = vec![0.0; dim];
        let mut g_bias = 0.0;
        let (mut policy_loss, mut value_loss, mut ratio_sum) = (0.0, 0.0, 0.0);
        let mut clipped = 0usize;

        for (i, sample) in batch.iter().enumerate() {
            let w = sample.weight.max(0.0) / total_weight;
            let phis = self.pair_features(&sample.state, &sample.candidates);
            let probs = Self::probabilities(params, &phis, self.temperature);
            let k = chosen[i];

            let ratio = compute_importance_ratio(probs[k].ln(), sample.behavior_log_prob);
            let a = advantages[i];
            let clipped_ratio = clip_ratio(ratio, self.clip_epsilon);
            policy_loss -= w * (ratio * a).min(clipped_ratio * a);
            ratio_sum += ratio;
            if (clipped_ratio - ratio).abs() > 1e-12 {
                clipped += 1;
            }

            if surrogate_is_active(ratio, a, self.clip_epsilon) {
                // d(-ratio * A)/d theta = -A * ratio * grad log pi(a|s)
                let scale = -w * a * ratio / self.temperature;
                for (j, phi) in phis.iter().enumerate() {
                    let indicator = if j == k { 1.0 } else { 0.0 };
                    let coeff = scale * (indicator - probs[j]);
                    for (g, x) in g_pref.iter_mut().zip(phi) {
                        *g += coeff * x;
                    }
                }
            }

            let v_err = values[i] - targets[i].value;
            value_loss += w * 0.5 * v_err * v_err;
            let v_scale = self.value_coeff * w * v_err;
            for (g, x) in g_value.iter_mut().zip(&state_feats[i]) {
                *g += v_scale * x;
            }
            g_bias += v_scale;
        }

        let mut work = self.params.clone();
        for j in 0..dim {
            work.preference[j] -= self.learning_rate * g_pref[j];
            work.value_weights[j] -= self.learning_rate * g_value[j];
        }
        work.value_bias -= self.learning_rate * g_bias;

        tokio::task::yield_now().await;

        let loss = policy_loss + self.value_coeff * value_loss;
        if !loss.is_finite() || !work.is_finite() {
            return Err(RlrError::non_finite(loss));
        }
        self.params = work;

        let n = batch.len();
        let stats = UpdateStats {
            loss,
            policy_loss,
            value_loss,
            mean_ratio: ratio_sum / n as f64,
            clip_fraction: clipped as f64 / n as f64,
            samples: n,
        };
        debug!(
            loss = stats.loss,
            mean_ratio = stats.mean_ratio,
            clip_fraction = stats.clip_fraction,
            samples = n,
            "policy update"
        );
        Ok(stats)
    }

    fn export_state(&self) -> PolicySnapshot {
        let mut candidate_cache: Vec<CachedCandidates> = {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache
                .iter()
                .map(|(state, candidates)| CachedCandidates {
                    state: state.clone(),
                    candidates: candidates.clone(),
                })
                .collect()
        };
        candidate_cache.sort_by_key(|c| c.state.render());

        PolicySnapshot {
            feature_dim: self.featurizer.dim(),
            preference: self.params.preference.clone(),
            value_weights: self.params.value_weights.clone(),
            value_bias: self.params.value_bias,
            candidate_cache,
            rng: self.rng.clone(),
        }
    }

    fn import_state(&mut self, snapshot: PolicySnapshot) -> Result<()> {
        let dim = self.featurizer.dim();
        if snapshot.feature_dim != dim
            || snapshot.preference.len() != dim
            || snapshot.value_weights.len() != dim
        {
            return Err(RlrError::ContractViolation(format!(
                "policy snapshot has feature dimension {}, policy expects {}",
                snapshot.feature_dim, dim
            )));
        }

        self.params = Params {
            preference: snapshot.preference,
            value_weights: snapshot.value_weights,
            value_bias: snapshot.value_bias,
        };
        self.rng = snapshot.rng;
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = snapshot
            .candidate_cache
            .into_iter()
            .map(|c| (c.state, c.candidates))
            .collect();
        Ok(())
    }
}
