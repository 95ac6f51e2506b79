//! Synthetic experience from the world model.
//!
//! Starting at real states, the policy's greedy action is rolled forward
//! through [`WorldModel::predict`]. Confidence multiplies along the rollout,
//! and the resulting [`ImaginedTransition`]s are weighted by it in policy
//! updates. They never enter the replay buffer.

use tracing::debug;

use crate::error::Result;
use crate::policy::{Policy, PolicyTarget, ScoredAction};
use crate::trajectory::types::{Action, ImaginedTransition, State};
use crate::world_model::{WorldModel, WorldModelPrediction};

/// Roll `horizon` greedy steps from each start state.
///
/// A rollout stops early when the predicted done probability reaches
/// `done_threshold`. A non-fatal error ends only that rollout.
pub async fn imagine_rollouts<W: WorldModel, P: Policy>(
    world_model: &W,
    policy: &P,
    starts: &[State],
    horizon: usize,
    done_threshold: f64,
) -> Result<Vec<ImaginedTransition>> {
    let mut out = Vec::new();

    for start in starts {
        let mut state = start.clone();
        let mut confidence = 1.0;

        for depth in 1..=horizon {
            let (best, candidates, prediction) =
                match greedy_step(world_model, policy, &state).await {
                    Ok(Some(found)) => found,
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        debug!(depth, error = %e, "imagined rollout cut short");
                        break;
                    }
                };

            confidence *= prediction.confidence.clamp(0.0, 1.0);
            let behavior_log_prob = policy.log_prob(&state, &candidates, &best.action);
            let next_state = prediction.next_state_estimate.clone();
            let done = prediction.done_probability >= done_threshold;

            out.push(ImaginedTransition {
                state: std::mem::replace(&mut state, next_state.clone()),
                action: best.action,
                reward: prediction.reward_estimate,
                next_state,
                done_probability: prediction.done_probability,
                confidence,
                depth,
                candidates,
                behavior_log_prob,
            });

            if done {
                break;
            }
        }
    }

    Ok(out)
}

async fn greedy_step<W: WorldModel, P: Policy>(
    world_model: &W,
    policy: &P,
    state: &State,
) -> Result<Option<(ScoredAction, Vec<Action>, WorldModelPrediction)>> {
    let eval = policy.evaluate(state).await?;
    let Some(best) = eval.greedy().cloned() else {
        return Ok(None);
    };
    let prediction = world_model.predict(state, &best.action).await?;
    Ok(Some((best, eval.candidates(), prediction)))
}

/// One-step bootstrapped value target for an imagined transition.
pub fn imagined_target<P: Policy>(policy: &P, t: &ImaginedTransition, gamma: f64) -> PolicyTarget {
    let continuation = (1.0 - t.done_probability).clamp(0.0, 1.0);
    PolicyTarget {
        value: t.reward + gamma * continuation * policy.state_value(&t.next_state),
    }
}
