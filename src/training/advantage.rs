//! Credit-assignment utilities.
//!
//! Discounted returns, one-step TD targets, batch advantage normalization,
//! and the importance ratio / clipping pair used to correct for replayed
//! data collected under an older policy:
//!
//!   rho = exp(log pi_theta(a|s) - log pi_behavior(a|s))
//!   L   = min(rho * A, clip(rho, 1-eps, 1+eps) * A)

/// Discounted return-to-go for every step of an episode.
///
///   G_t = r_t + gamma * G_{t+1}
pub fn discounted_returns(rewards: &[f64], gamma: f64) -> Vec<f64> {
    let mut returns = vec![0.0; rewards.len()];
    let mut running = 0.0;
    for (i, r) in rewards.iter().enumerate().rev() {
        running = r + gamma * running;
        returns[i] = running;
    }
    returns
}

/// One-step bootstrapped target: r + gamma * V(s') for non-terminal steps.
pub fn td_target(reward: f64, done: bool, next_value: f64, gamma: f64) -> f64 {
    if done {
        reward
    } else {
        reward + gamma * next_value
    }
}

/// Blend a return target with a planner value estimate.
pub fn blend_with_plan(target: f64, planner_value: Option<f64>, weight: f64) -> f64 {
    match planner_value {
        Some(v) if v.is_finite() => (1.0 - weight) * target + weight * v,
        _ => target,
    }
}

/// Z-score raw advantages within a batch.
///
///   A_i = (a_i - mean(a)) / std(a)
///
/// # Edge cases
///
/// - Empty input gives an empty vector.
/// - If all values are identical (std = 0), all advantages are 0.0.
pub fn normalize_advantages(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }

    let n = raw.len() as f64;
    let mean = raw.iter().sum::<f64>() / n;

    // Population std: we normalize within a fixed batch.
    let variance = raw.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    if std < 1e-8 {
        return vec![0.0; raw.len()];
    }

    raw.iter().map(|r| (r - mean) / std).collect()
}

/// Importance ratio between the current and behaviour policies.
///
///   rho = exp(log pi_theta - log pi_behavior)
pub fn compute_importance_ratio(current_log_prob: f64, behavior_log_prob: f64) -> f64 {
    (current_log_prob - behavior_log_prob).exp()
}

/// Clip an importance ratio to [1 - epsilon, 1 + epsilon].
pub fn clip_ratio(ratio: f64, epsilon: f64) -> f64 {
    ratio.clamp(1.0 - epsilon, 1.0 + epsilon)
}

/// Whether the clipped surrogate still passes gradient for this sample.
///
/// The pessimistic bound `min(rho * A, clip(rho) * A)` is flat in theta when
/// the clipped branch is the smaller one and the ratio sits outside the band.
pub fn surrogate_is_active(ratio: f64, advantage: f64, epsilon: f64) -> bool {
    let clipped = clip_ratio(ratio, epsilon);
    if (clipped - ratio).abs() <= 1e-12 {
        return true;
    }
    ratio * advantage <= clipped * advantage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discounted_returns_reward_schedule() {
        let returns = discounted_returns(&[0.0, 0.0, 1.0], 0.9);
        assert!((returns[2] - 1.0).abs() < 1e-12);
        assert!((returns[1] - 0.9).abs() < 1e-12);
        assert!((returns[0] - 0.81).abs() < 1e-12);
    }

    #[test]
    fn test_discounted_returns_empty() {
        assert!(discounted_returns(&[], 0.99).is_empty());
    }

    #[test]
    fn test_td_target() {
        assert!((td_target(1.0, true, 5.0, 0.9) - 1.0).abs() < 1e-12);
        assert!((td_target(1.0, false, 5.0, 0.9) - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_blend_with_plan() {
        assert!((blend_with_plan(1.0, None, 0.5) - 1.0).abs() < 1e-12);
        assert!((blend_with_plan(1.0, Some(3.0), 0.5) - 2.0).abs() < 1e-12);
        assert!((blend_with_plan(1.0, Some(f64::NEG_INFINITY), 0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_basic() {
        let advs = normalize_advantages(&[0.0, 0.0, 1.0, 1.0]);
        assert!((advs[0] + 1.0).abs() < 1e-9);
        assert!((advs[3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_same() {
        for a in normalize_advantages(&[1.0, 1.0, 1.0]) {
            assert!(a.abs() < 1e-9);
        }
    }

    #[test]
    fn test_normalize_sums_to_zero() {
        let advs = normalize_advantages(&[0.1, 0.4, 0.7, 0.9, 1.0, 0.0]);
        let sum: f64 = advs.iter().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[test]
    fn test_importance_ratio() {
        assert!((compute_importance_ratio(-2.5, -2.5) - 1.0).abs() < 1e-9);
        assert!((compute_importance_ratio(-1.0, -2.0) - 1.0_f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_clip_ratio() {
        assert!((clip_ratio(1.1, 0.2) - 1.1).abs() < 1e-9);
        assert!((clip_ratio(1.5, 0.2) - 1.2).abs() < 1e-9);
        assert!((clip_ratio(0.5, 0.2) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_surrogate_activity() {
        // Inside the band: always active.
        assert!(surrogate_is_active(1.05, 1.0, 0.2));
        // Ratio too high with positive advantage: clipped branch wins, flat.
        assert!(!surrogate_is_active(2.0, 1.0, 0.2));
        // Ratio too high with negative advantage: unclipped branch is the min.
        assert!(surrogate_is_active(2.0, -1.0, 0.2));
        // Ratio too low with negative advantage: clipped branch wins, flat.
        assert!(!surrogate_is_active(0.5, -1.0, 0.2));
    }
}
