//! The model-based training loop.
//!
//! ```text
//! EPISODE: reset
//!   COLLECT   act (or plan) -> env.step -> record into the trajectory
//!   STORE     per step, or the finalized trajectory at episode end
//!   FIT       every `fit_interval` collected transitions
//!   UPDATE    every `update_interval` collected transitions
//! ```
//!
//! Collaborator failures never end a run. A failed reset skips the episode, a
//! failed step ends it with a penalty transition, and a failed fit or update
//! skips that phase. Only `ContractViolation` (and divergence in strict mode)
//! propagates out of [`RlTrainer::run`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::{EvictionPolicy, ReplayBuffer, SamplingStrategy, SlotId};
use crate::config::{Config, StoreMode};
use crate::env::Environment;
use crate::error::{Result, RlrError};
use crate::planner::{Planner, SimplePlanner};
use crate::policy::{Policy, PolicyTarget, TrainingSample};
use crate::trajectory::types::{Action, RealTransition, State, Trajectory};
use crate::world_model::WorldModel;

use super::advantage::{blend_with_plan, td_target};
use super::imagination::{imagine_rollouts, imagined_target};
use super::snapshot::{TrainerCounters, TrainerSnapshot};
use super::telemetry::{Phase, TelemetryEvent, TelemetryLog};

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// What one call to [`RlTrainer::run`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Episodes that reached the environment (reset succeeded).
    pub episodes: usize,
    /// Episodes skipped because reset failed.
    pub skipped_episodes: usize,
    /// Episodes cut short by a failed act or step.
    pub aborted_episodes: usize,
    pub transitions: usize,
    pub fits: usize,
    pub fits_skipped: usize,
    pub updates: usize,
    pub updates_skipped: usize,
    /// Mean undiscounted return over collected episodes.
    pub mean_return: f64,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct EpisodeOutcome {
    episode_return: f64,
    aborted: bool,
}

/// An action chosen for a real step, with what the update needs later.
struct Choice {
    action: Action,
    candidates: Vec<Action>,
    log_prob: f64,
    planner_value: Option<f64>,
}

/// Run `fut` under a millisecond limit.
async fn within<T>(
    operation: &str,
    limit_ms: u64,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(limit_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(RlrError::Timeout {
            operation: operation.to_string(),
            limit_ms,
        }),
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Orchestrates collection, storage, world model fitting and policy updates.
pub struct RlTrainer<W: WorldModel, P: Policy> {
    config: Config,
    buffer: ReplayBuffer,
    world_model: W,
    policy: P,
    planner: SimplePlanner,
    telemetry: TelemetryLog,
    counters: TrainerCounters,
}

impl<W: WorldModel, P: Policy> RlTrainer<W, P> {
    /// Build a trainer. The configuration is validated and then fixed for the
    /// trainer's lifetime.
    pub fn new(config: Config, world_model: W, policy: P) -> Result<Self> {
        config.validate()?;
        let t = &config.training;
        let eviction = if t.prioritized_replay {
            EvictionPolicy::Priority
        } else {
            EvictionPolicy::Fifo
        };
        let buffer = ReplayBuffer::new(t.buffer_capacity, eviction, t.priority_alpha, t.seed)?;
        let planner = SimplePlanner::from_config(&config);
        let telemetry = TelemetryLog::with_retention(config.logging.telemetry_retain);

        info!(
            capacity = t.buffer_capacity,
            batch = t.sample_batch_size,
            fit_interval = t.fit_interval,
            update_interval = t.update_interval,
            planning = t.use_planning,
            prioritized = t.prioritized_replay,
            "trainer initialized"
        );

        Ok(Self {
            config,
            buffer,
            world_model,
            policy,
            planner,
            telemetry,
            counters: TrainerCounters::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn world_model(&self) -> &W {
        &self.world_model
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut TelemetryLog {
        &mut self.telemetry
    }

    pub fn counters(&self) -> TrainerCounters {
        self.counters
    }

    // ------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------

    /// Run `episodes` episodes against `env`.
    pub async fn run<E: Environment>(&mut self, env: &mut E, episodes: usize) -> Result<RunSummary> {
        let before = self.counters;
        let mut summary = RunSummary::default();
        let mut total_return = 0.0;

        for _ in 0..episodes {
            let outcome = match self.run_episode(env).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.flush_telemetry();
                    return Err(e);
                }
            };
            match outcome {
                Some(outcome) => {
                    summary.episodes += 1;
                    total_return += outcome.episode_return;
                    if outcome.aborted {
                        summary.aborted_episodes += 1;
                    }
                }
                None => summary.skipped_episodes += 1,
            }
        }
        self.flush_telemetry();

        let after = self.counters;
        summary.transitions = after.transitions - before.transitions;
        summary.fits = after.fits - before.fits;
        summary.fits_skipped = after.fits_skipped - before.fits_skipped;
        summary.updates = after.updates - before.updates;
        summary.updates_skipped = after.updates_skipped - before.updates_skipped;
        summary.buffer_size = self.buffer.size();
        if summary.episodes > 0 {
            summary.mean_return = total_return / summary.episodes as f64;
        }

        info!(
            episodes = summary.episodes,
            skipped = summary.skipped_episodes,
            aborted = summary.aborted_episodes,
            transitions = summary.transitions,
            fits = summary.fits,
            updates = summary.updates,
            mean_return = summary.mean_return,
            buffer_size = summary.buffer_size,
            "training run finished"
        );
        Ok(summary)
    }

    /// One episode. `None` when reset failed and nothing was collected.
    async fn run_episode<E: Environment>(&mut self, env: &mut E) -> Result<Option<EpisodeOutcome>> {
        let step_limit = self.config.training.step_timeout_ms;
        let gamma = self.config.training.discount_factor;
        let penalty = self.config.training.invalid_action_penalty;
        let store_mode = self.config.training.store_mode;
        let cap = match env.max_steps() {
            0 => self.config.training.max_episode_steps,
            n => n.min(self.config.training.max_episode_steps),
        };

        let reset = tokio::time::timeout(Duration::from_millis(step_limit), env.reset()).await;
        let mut state = match reset {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                self.skip(Phase::Reset, format!("{e:#}"));
                return Ok(None);
            }
            Err(_) => {
                self.skip(Phase::Reset, format!("reset timed out after {step_limit} ms"));
                return Ok(None);
            }
        };

        let mut trajectory = Trajectory::new();
        debug!(episode = %trajectory.id, problem = %state.problem, "episode started");

        while trajectory.len() < cap {
            let step_index = trajectory.len();
            let choice = match self.choose_action(&state, step_index).await {
                Ok(choice) => choice,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.skip(Phase::Act, e.to_string());
                    trajectory.aborted = true;
                    break;
                }
            };

            let stepped =
                tokio::time::timeout(Duration::from_millis(step_limit), env.step(&choice.action))
                    .await;
            let (next_state, reward, env_done, info) = match stepped {
                Ok(Ok(outcome)) => (outcome.state, outcome.reward, outcome.done, outcome.info),
                failed => {
                    let reason = match failed {
                        Ok(Err(e)) => RlrError::EpisodeAborted(format!("{e:#}")),
                        _ => RlrError::Timeout {
                            operation: "step".into(),
                            limit_ms: step_limit,
                        },
                    }
                    .to_string();
                    warn!(
                        episode = %trajectory.id,
                        step = step_index,
                        reason = %reason,
                        "environment step failed, ending episode"
                    );
                    trajectory.aborted = true;
                    (
                        state.clone(),
                        -penalty,
                        true,
                        serde_json::json!({ "error": reason }),
                    )
                }
            };
            let done = env_done || step_index + 1 >= cap;

            let recorded = trajectory
                .record(
                    state,
                    choice.action,
                    reward,
                    next_state.clone(),
                    done,
                    choice.candidates,
                    choice.log_prob,
                    choice.planner_value,
                    info,
                )?
                .clone();
            self.counters.transitions += 1;
            self.counters.since_fit += 1;
            self.counters.since_update += 1;

            if store_mode == StoreMode::Step {
                self.store(recorded);
                self.learn().await?;
            }

            state = next_state;
            if done {
                break;
            }
        }

        let outcome = EpisodeOutcome {
            episode_return: trajectory.total_reward,
            aborted: trajectory.aborted,
        };
        let episode_id = trajectory.id.clone();
        let steps = trajectory.len();

        if store_mode == StoreMode::Episode {
            // Monte-Carlo returns only mean something for finished episodes.
            let records = if trajectory.is_terminal() {
                trajectory.finalize(gamma)
            } else {
                trajectory.transitions().to_vec()
            };
            for r in records {
                self.store(r);
            }
        }

        self.counters.episodes += 1;
        self.telemetry.record(
            self.counters.transitions,
            TelemetryEvent::Episode {
                episode_id,
                episode_return: outcome.episode_return,
                steps,
                aborted: outcome.aborted,
            },
        );

        if store_mode == StoreMode::Episode {
            self.learn().await?;
        }
        Ok(Some(outcome))
    }

    /// Policy action, or the planner's when planning is due at this step.
    async fn choose_action(&mut self, state: &State, step_index: usize) -> Result<Choice> {
        let t = &self.config.training;
        let plan_now = t.use_planning && step_index % t.planning_interval == 0;
        let budget = t.planning_budget;
        let plan_limit = t.plan_timeout_ms;
        let act_limit = t.step_timeout_ms;

        if plan_now {
            let planned = within(
                "plan",
                plan_limit,
                self.planner
                    .plan(state, &self.world_model, &self.policy, &budget),
            )
            .await;
            match planned {
                Ok(p) => {
                    self.telemetry.record(
                        self.counters.transitions,
                        TelemetryEvent::Plan {
                            value: p.value_estimate,
                            depth: p.rollout_depth_reached,
                            nodes: p.nodes_expanded,
                            confidence: p.confidence,
                        },
                    );
                    let planner_value = (p.rollout_depth_reached > 0).then_some(p.value_estimate);
                    return Ok(Choice {
                        action: p.action,
                        candidates: p.candidates,
                        log_prob: p.log_prob,
                        planner_value,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.skip(Phase::Plan, e.to_string()),
            }
        }

        let sample = within("act", act_limit, self.policy.act(state)).await?;
        Ok(Choice {
            action: sample.action,
            candidates: sample.candidates,
            log_prob: sample.log_prob,
            planner_value: None,
        })
    }

    fn store(&mut self, transition: RealTransition) {
        let inserted = self.buffer.insert(transition);
        if let Some(evicted) = inserted.evicted {
            debug!(
                slot = inserted.slot.index,
                evicted_episode = evicted.episode_id(),
                "buffer full, record evicted"
            );
        }
    }

    /// Run whichever learning phases are due, once per elapsed interval.
    ///
    /// Episode-mode storage can bring several intervals due at once; the
    /// remainder carries over to the next call.
    async fn learn(&mut self) -> Result<()> {
        let fit_interval = self.config.training.fit_interval;
        let update_interval = self.config.training.update_interval;
        while self.counters.since_fit >= fit_interval {
            self.counters.since_fit -= fit_interval;
            self.fit_world_model().await?;
        }
        while self.counters.since_update >= update_interval {
            self.counters.since_update -= update_interval;
            self.update_policy().await?;
        }
        Ok(())
    }

    fn flush_telemetry(&mut self) {
        if let Err(e) = self.telemetry.flush() {
            warn!(error = %format!("{e:#}"), "failed to flush telemetry");
        }
    }

    fn skip(&mut self, phase: Phase, reason: impl Into<String>) {
        self.telemetry.record(
            self.counters.transitions,
            TelemetryEvent::PhaseSkipped {
                phase,
                reason: reason.into(),
            },
        );
    }

    // ------------------------------------------------------------------
    // FIT_WORLD_MODEL
    // ------------------------------------------------------------------

    /// Sample a batch and fit the world model on it.
    pub async fn fit_world_model(&mut self) -> Result<()> {
        let t = &self.config.training;
        let prioritized = t.prioritized_replay;
        let strategy = if prioritized {
            SamplingStrategy::Weighted
        } else {
            SamplingStrategy::Uniform
        };
        let batch_size = t.sample_batch_size;
        let limit = t.fit_timeout_ms;

        let batch = match self.buffer.sample(batch_size, strategy) {
            Ok(batch) => batch,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.counters.fits_skipped += 1;
                self.skip(Phase::Fit, e.to_string());
                return Ok(());
            }
        };
        let records: Vec<Arc<RealTransition>> =
            batch.iter().map(|s| Arc::clone(&s.transition)).collect();

        match within("fit", limit, self.world_model.fit(&records)).await {
            Ok(stats) => {
                if prioritized {
                    let feedback: Vec<(SlotId, f64)> = batch
                        .iter()
                        .zip(&stats.sample_errors)
                        .map(|(s, e)| (s.slot, *e))
                        .collect();
                    let changed = self.buffer.update_priorities(&feedback);
                    debug!(changed, "replay priorities updated");
                }
                self.counters.fits += 1;
                let loss = stats.loss;
                self.telemetry
                    .record(self.counters.transitions, TelemetryEvent::Fit(stats));
                self.check_divergence(loss)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.counters.fits_skipped += 1;
                let diverged = matches!(e, RlrError::ModelDivergence { .. });
                self.skip(Phase::Fit, e.to_string());
                if diverged {
                    self.check_divergence(f64::INFINITY)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn check_divergence(&mut self, loss: f64) -> Result<()> {
        let ceiling = self.config.training.divergence_ceiling;
        if loss.is_finite() && loss <= ceiling {
            self.counters.divergence_streak = 0;
            return Ok(());
        }

        self.counters.divergence_streak += 1;
        let consecutive = self.counters.divergence_streak;
        if consecutive < self.config.training.divergence_patience {
            return Ok(());
        }

        self.telemetry.record(
            self.counters.transitions,
            TelemetryEvent::Divergence { loss, consecutive },
        );
        if self.config.training.strict_divergence {
            return Err(RlrError::ModelDivergence {
                loss,
                ceiling,
                consecutive,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // UPDATE_POLICY
    // ------------------------------------------------------------------

    /// Sample a batch, build value targets, add imagined experience and take
    /// one policy step.
    pub async fn update_policy(&mut self) -> Result<()> {
        let t = &self.config.training;
        let gamma = t.discount_factor;
        let plan_weight = t.plan_target_weight;
        let batch_size = t.sample_batch_size;
        let rollouts = t.imagined_rollouts;
        let horizon = t.imagination_horizon;
        let imagine_limit = t.plan_timeout_ms;
        let update_limit = t.update_timeout_ms;
        let done_threshold = self.config.model.done_threshold;

        let batch = match self.buffer.sample(batch_size, SamplingStrategy::Uniform) {
            Ok(batch) => batch,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.counters.updates_skipped += 1;
                self.skip(Phase::Update, e.to_string());
                return Ok(());
            }
        };

        let mut samples = Vec::with_capacity(batch.len() + rollouts * horizon);
        let mut targets = Vec::with_capacity(samples.capacity());
        for s in &batch {
            let tr = &s.transition;
            let base = match tr.return_to_go() {
                Some(g) => g,
                None => td_target(
                    tr.reward(),
                    tr.done(),
                    self.policy.state_value(tr.next_state()),
                    gamma,
                ),
            };
            targets.push(PolicyTarget {
                value: blend_with_plan(base, tr.planner_value(), plan_weight),
            });
            samples.push(TrainingSample::from_real(tr));
        }

        if rollouts > 0 {
            let starts: Vec<State> = batch
                .iter()
                .cycle()
                .take(rollouts)
                .map(|s| s.transition.state().clone())
                .collect();
            let imagined = within(
                "imagine",
                imagine_limit,
                imagine_rollouts(
                    &self.world_model,
                    &self.policy,
                    &starts,
                    horizon,
                    done_threshold,
                ),
            )
            .await;
            match imagined {
                Ok(imagined) => {
                    debug!(imagined = imagined.len(), "imagined transitions added");
                    for it in &imagined {
                        targets.push(imagined_target(&self.policy, it, gamma));
                        samples.push(TrainingSample::from_imagined(it));
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.skip(Phase::Imagine, e.to_string()),
            }
        }

        match within("update", update_limit, self.policy.update(&samples, &targets)).await {
            Ok(stats) => {
                self.counters.updates += 1;
                self.telemetry
                    .record(self.counters.transitions, TelemetryEvent::Update(stats));
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.counters.updates_skipped += 1;
                self.skip(Phase::Update, e.to_string());
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn export_state(&self) -> TrainerSnapshot<W::Snapshot, P::Snapshot> {
        TrainerSnapshot {
            created_at: Utc::now(),
            config: self.config.clone(),
            counters: self.counters,
            buffer: self.buffer.export_state(),
            world_model: self.world_model.export_state(),
            policy: self.policy.export_state(),
            planner: self.planner.clone(),
        }
    }

    /// Restore every component. The trainer keeps its own configuration.
    ///
    /// On error the trainer may be partially restored and should be dropped.
    pub fn import_state(&mut self, snapshot: TrainerSnapshot<W::Snapshot, P::Snapshot>) -> Result<()> {
        self.world_model.import_state(snapshot.world_model)?;
        self.policy.import_state(snapshot.policy)?;
        self.buffer.import_state(snapshot.buffer)?;
        self.planner = snapshot.planner;
        self.counters = snapshot.counters;
        Ok(())
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        self.export_state().save_to_file(path)
    }

    pub fn load_snapshot(&mut self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let snapshot = TrainerSnapshot::load_from_file(path)?;
        self.import_state(snapshot)?;
        Ok(())
    }
}
