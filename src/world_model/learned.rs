//! Hashed-feature world model.
//!
//! - reward head: linear regression over (state, action) features
//! - done head: logistic regression over the same features
//! - next-state head: a transition memory keyed by the exact (state, action)
//!   pair; pairs never observed are extrapolated by appending the action to
//!   the trace
//!
//! The memory holds at most `memory_capacity` pairs. When full, the pair with
//! the fewest visits is forgotten, the least recently seen one among equals.
//!
//! Heads are trained by full-batch gradient descent on a working copy that is
//! committed only when `fit` completes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ErrorStats, FitStats, WorldModel, WorldModelPrediction};
use crate::config::ModelConfig;
use crate::error::{Result, RlrError};
use crate::features::{cosine_distance, dot, sigmoid, Featurizer};
use crate::trajectory::types::{Action, RealTransition, State};

/// Weight of the newest fit in the error averages.
const EMA_WEIGHT: f64 = 0.1;
const LOG_EPS: f64 = 1e-12;
/// Memorized pairs kept when no capacity is configured.
const DEFAULT_MEMORY_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadWeights {
    pub reward_weights: Vec<f64>,
    pub reward_bias: f64,
    pub done_weights: Vec<f64>,
    pub done_bias: f64,
}

impl HeadWeights {
    fn zeros(dim: usize) -> Self {
        Self {
            reward_weights: vec![0.0; dim],
            reward_bias: 0.0,
            done_weights: vec![0.0; dim],
            done_bias: 0.0,
        }
    }

    fn reward(&self, x: &[f64]) -> f64 {
        dot(&self.reward_weights, x) + self.reward_bias
    }

    fn done(&self, x: &[f64]) -> f64 {
        sigmoid(dot(&self.done_weights, x) + self.done_bias)
    }

    fn is_finite(&self) -> bool {
        self.reward_bias.is_finite()
            && self.done_bias.is_finite()
            && self.reward_weights.iter().all(|w| w.is_finite())
            && self.done_weights.iter().all(|w| w.is_finite())
    }

    /// One full-batch gradient step on squared reward error and done log-loss.
    fn step(&mut self, xs: &[Vec<f64>], rewards: &[f64], dones: &[f64], lr: f64) {
        let n = xs.len() as f64;
        let dim = self.reward_weights.len();
        let mut g_rw = vec![0.0; dim];
        let mut g_dw = vec![0.0; dim];
        let mut g_rb = 0.0;
        let mut g_db = 0.0;

        for ((x, r), d) in xs.iter().zip(rewards).zip(dones) {
            let r_err = self.reward(x) - r;
            let d_err = self.done(x) - d;
            for (i, xi) in x.iter().enumerate() {
                g_rw[i] += r_err * xi;
                g_dw[i] += d_err * xi;
            }
            g_rb += r_err;
            g_db += d_err;
        }

        for i in 0..dim {
            self.reward_weights[i] -= lr * g_rw[i] / n;
            self.done_weights[i] -= lr * g_dw[i] / n;
        }
        self.reward_bias -= lr * g_rb / n;
        self.done_bias -= lr * g_db / n;
    }

    fn loss(&self, xs: &[Vec<f64>], rewards: &[f64], dones: &[f64]) -> f64 {
        let n = xs.len() as f64;
        let total: f64 = xs
            .iter()
            .zip(rewards)
            .zip(dones)
            .map(|((x, r), d)| {
                let r_err = self.reward(x) - r;
                let p = self.done(x).clamp(LOG_EPS, 1.0 - LOG_EPS);
                0.5 * r_err * r_err - (d * p.ln() + (1.0 - d) * (1.0 - p).ln())
            })
            .sum();
        total / n
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Memorized {
    next_state: State,
    visits: u64,
    /// Memory clock value at the last observation.
    last_seen: u64,
}

/// Serialized form of one memorized transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub state: State,
    pub action: Action,
    pub next_state: State,
    pub visits: u64,
    #[serde(default)]
    pub last_seen: u64,
}

/// Everything needed to reproduce a model's predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldModelSnapshot {
    pub feature_dim: usize,
    pub heads: HeadWeights,
    pub memory: Vec<MemoryEntry>,
    /// Observations memorized so far; orders `last_seen`.
    #[serde(default)]
    pub clock: u64,
    pub stats: ErrorStats,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LearnedWorldModel {
    featurizer: Featurizer,
    learning_rate: f64,
    epochs: usize,
    unseen_confidence: f64,
    heads: HeadWeights,
    memory: HashMap<State, HashMap<Action, Memorized>>,
    memory_capacity: usize,
    clock: u64,
    stats: ErrorStats,
}

impl LearnedWorldModel {
    pub fn new(feature_dim: usize, learning_rate: f64, epochs: usize, unseen_confidence: f64) -> Self {
        let featurizer = Featurizer::new(feature_dim);
        Self {
            heads: HeadWeights::zeros(featurizer.dim()),
            featurizer,
            learning_rate,
            epochs,
            unseen_confidence: unseen_confidence.clamp(0.0, 1.0),
            memory: HashMap::new(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            clock: 0,
            stats: ErrorStats::default(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.feature_dim,
            config.world_model_learning_rate,
            config.fit_epochs,
            config.unseen_confidence,
        )
        .with_memory_capacity(config.memory_capacity)
    }

    /// Cap the transition memory at `capacity` pairs (at least one).
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity.max(1);
        self.shrink_memory(self.memory_capacity);
        self
    }

    pub fn memory_capacity(&self) -> usize {
        self.memory_capacity
    }

    /// Number of distinct (state, action) pairs memorized.
    pub fn memorized_pairs(&self) -> usize {
        self.memory.values().map(HashMap::len).sum()
    }

    fn recall(&self, state: &State, action: &Action) -> Option<&Memorized> {
        self.memory.get(state).and_then(|m| m.get(action))
    }

    /// Confidence from recent error alone, before novelty is accounted for.
    fn error_confidence(&self) -> f64 {
        let s = &self.stats;
        1.0 / (1.0 + s.reward_error_ema + s.state_divergence_ema + s.done_error_ema)
    }

    fn expected_next(&self, state: &State, action: &Action) -> State {
        match self.recall(state, action) {
            Some(m) => m.next_state.clone(),
            None => state.advance(action),
        }
    }

    fn divergence(&self, predicted: &State, actual: &State) -> f64 {
        if predicted == actual {
            return 0.0;
        }
        cosine_distance(&self.featurizer.state(predicted), &self.featurizer.state(actual))
    }

    fn memorize(&mut self, transition: &RealTransition) {
        self.clock += 1;
        let now = self.clock;
        let known = self
            .memory
            .get_mut(transition.state())
            .and_then(|per_state| per_state.get_mut(transition.action()));
        if let Some(m) = known {
            if &m.next_state == transition.next_state() {
                m.visits += 1;
            } else {
                m.next_state = transition.next_state().clone();
                m.visits = 1;
            }
            m.last_seen = now;
            return;
        }

        self.shrink_memory(self.memory_capacity - 1);
        self.memory.entry(transition.state().clone()).or_default().insert(
            transition.action().clone(),
            Memorized {
                next_state: transition.next_state().clone(),
                visits: 1,
                last_seen: now,
            },
        );
    }

    /// Forget pairs until at most `keep` remain.
    fn shrink_memory(&mut self, keep: usize) {
        let mut pairs = self.memorized_pairs();
        while pairs > keep {
            let victim = self
                .memory
                .iter()
                .flat_map(|(state, per_state)| {
                    per_state
                        .iter()
                        .map(move |(action, m)| ((m.visits, m.last_seen), state, action))
                })
                .min_by_key(|(rank, _, _)| *rank)
                .map(|(_, state, action)| (state.clone(), action.clone()));
            let Some((state, action)) = victim else {
                break;
            };
            if let Some(per_state) = self.memory.get_mut(&state) {
                per_state.remove(&action);
                if per_state.is_empty() {
                    self.memory.remove(&state);
                }
            }
            pairs -= 1;
        }
    }

    fn fold_stats(&mut self, reward_error: f64, done_error: f64, divergence: f64) {
        let s = &mut self.stats;
        if s.fits == 0 {
            s.reward_error_ema = reward_error;
            s.done_error_ema = done_error;
            s.state_divergence_ema = divergence;
        } else {
            s.reward_error_ema += EMA_WEIGHT * (reward_error - s.reward_error_ema);
            s.done_error_ema += EMA_WEIGHT * (done_error - s.done_error_ema);
            s.state_divergence_ema += EMA_WEIGHT * (divergence - s.state_divergence_ema);
        }
        s.fits += 1;
    }
}

impl WorldModel for LearnedWorldModel {
    type Snapshot = WorldModelSnapshot;

    async fn predict(&self, state: &State, action: &Action) -> Result<WorldModelPrediction> {
        let x = self.featurizer.pair(state, action);
        let reward_estimate = self.heads.reward(&x);
        if !reward_estimate.is_finite() {
            return Err(RlrError::non_finite(reward_estimate));
        }
        let done_probability = self.heads.done(&x);
        if !done_probability.is_finite() {
            return Err(RlrError::non_finite(done_probability));
        }

        let base = self.error_confidence();
        let (next_state_estimate, novelty) = match self.recall(state, action) {
            Some(m) => {
                let visits = m.visits as f64;
                (m.next_state.clone(), visits / (visits + 1.0))
            }
            None => (state.advance(action), self.unseen_confidence),
        };

        Ok(WorldModelPrediction {
            next_state_estimate,
            reward_estimate,
            done_probability,
            confidence: (base * novelty).clamp(0.0, 1.0),
        })
    }

    async fn fit(&mut self, batch: &[Arc<RealTransition>]) -> Result<FitStats> {
        if batch.is_empty() {
            return Ok(FitStats::default());
        }

        let n = batch.len() as f64;
        let xs: Vec<Vec<f64>> = batch
            .iter()
            .map(|t| self.featurizer.pair(t.state(), t.action()))
            .collect();
        let rewards: Vec<f64> = batch.iter().map(|t| t.reward()).collect();
        let dones: Vec<f64> = batch.iter().map(|t| if t.done() { 1.0 } else { 0.0 }).collect();

        // Errors of the parameters as they stood before this fit.
        let mut sample_errors = Vec::with_capacity(batch.len());
        let (mut reward_sum, mut done_sum, mut div_sum) = (0.0, 0.0, 0.0);
        for (i, t) in batch.iter().enumerate() {
            let r_err = (self.heads.reward(&xs[i]) - rewards[i]).abs();
            let d_err = (self.heads.done(&xs[i]) - dones[i]).abs();
            let div = self.divergence(&self.expected_next(t.state(), t.action()), t.next_state());
            reward_sum += r_err;
            done_sum += d_err;
            div_sum += div;
            sample_errors.push(r_err + div);
        }

        let mut work = self.heads.clone();
        for _ in 0..self.epochs {
            work.step(&xs, &rewards, &dones, self.learning_rate);
            tokio::task::yield_now().await;
        }

        let loss = work.loss(&xs, &rewards, &dones);
        if !loss.is_finite() || !work.is_finite() {
            return Err(RlrError::non_finite(loss));
        }

        // Commit.
        self.heads = work;
        for t in batch {
            self.memorize(t);
        }
        let stats = FitStats {
            loss,
            prediction_error: (reward_sum + div_sum) / n,
            reward_error: reward_sum / n,
            done_error: done_sum / n,
            state_divergence: div_sum / n,
            samples: batch.len(),
            sample_errors,
        };
        self.fold_stats(stats.reward_error, stats.done_error, stats.state_divergence);

        debug!(
            loss = stats.loss,
            prediction_error = stats.prediction_error,
            samples = stats.samples,
            memorized = self.memorized_pairs(),
            "world model fit"
        );
        Ok(stats)
    }

    fn reset_stats(&mut self) {
        self.stats = ErrorStats::default();
    }

    fn error_stats(&self) -> ErrorStats {
        self.stats
    }

    fn export_state(&self) -> WorldModelSnapshot {
        let mut memory: Vec<MemoryEntry> = self
            .memory
            .iter()
            .flat_map(|(state, per_state)| {
                per_state.iter().map(move |(action, m)| MemoryEntry {
                    state: state.clone(),
                    action: action.clone(),
                    next_state: m.next_state.clone(),
                    visits: m.visits,
                    last_seen: m.last_seen,
                })
            })
            .collect();
        memory.sort_by(|a, b| {
            a.state
                .render()
                .cmp(&b.state.render())
                .then_with(|| a.action.cmp(&b.action))
        });

        WorldModelSnapshot {
            feature_dim: self.featurizer.dim(),
            heads: self.heads.clone(),
            memory,
            clock: self.clock,
            stats: self.stats,
        }
    }

    fn import_state(&mut self, snapshot: WorldModelSnapshot) -> Result<()> {
        let dim = self.featurizer.dim();
        if snapshot.feature_dim != dim
            || snapshot.heads.reward_weights.len() != dim
            || snapshot.heads.done_weights.len() != dim
        {
            return Err(RlrError::ContractViolation(format!(
                "world model snapshot has feature dimension {}, model expects {}",
                snapshot.feature_dim, dim
            )));
        }

        let mut memory: HashMap<State, HashMap<Action, Memorized>> = HashMap::new();
        for entry in snapshot.memory {
            memory.entry(entry.state).or_default().insert(
                entry.action,
                Memorized {
                    next_state: entry.next_state,
                    visits: entry.visits,
                    last_seen: entry.last_seen,
                },
            );
        }

        self.heads = snapshot.heads;
        self.memory = memory;
        self.clock = snapshot.clock;
        self.stats = snapshot.stats;
        self.shrink_memory(self.memory_capacity);
        Ok(())
    }
}
