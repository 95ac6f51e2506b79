//! Deterministic hashed features for states and (state, action) pairs.
//!
//! Both the world model and the policy heads are linear over these vectors,
//! so the hash must be stable across processes: snapshots store weights that
//! are only meaningful under the same feature layout.

use serde::{Deserialize, Serialize};

use crate::trajectory::types::{Action, State};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(salt: &str, token: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in salt.bytes().chain([0xff]).chain(token.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Signed feature hashing into a fixed-width dense vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Featurizer {
    dim: usize,
}

impl Featurizer {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn add(&self, out: &mut [f64], salt: &str, token: &str, weight: f64) {
        let h = fnv1a(salt, token);
        let idx = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        out[idx] += sign * weight;
    }

    fn normalize(out: &mut [f64]) {
        let norm = out.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            out.iter_mut().for_each(|x| *x /= norm);
        }
    }

    fn write_state(&self, out: &mut [f64], state: &State) {
        let problem: Vec<String> = tokens(&state.problem).collect();
        for tok in &problem {
            self.add(out, "p", tok, 1.0);
        }
        for step in &state.trace {
            let words: Vec<String> = tokens(step).collect();
            for tok in &words {
                self.add(out, "t", tok, 1.0);
            }
            for pair in words.windows(2) {
                self.add(out, "tb", &format!("{} {}", pair[0], pair[1]), 0.5);
            }
        }
        self.add(out, "depth", &state.depth().to_string(), 1.0);
    }

    /// Features of a state alone (value heads).
    pub fn state(&self, state: &State) -> Vec<f64> {
        let mut out = vec![0.0; self.dim];
        self.write_state(&mut out, state);
        Self::normalize(&mut out);
        out
    }

    /// Joint features of a state and a candidate action.
    pub fn pair(&self, state: &State, action: &Action) -> Vec<f64> {
        let mut out = vec![0.0; self.dim];
        self.write_state(&mut out, state);
        let depth = state.depth().to_string();
        for tok in tokens(action.as_str()) {
            self.add(&mut out, "a", &tok, 2.0);
            self.add(&mut out, "ad", &format!("{depth}:{tok}"), 2.0);
        }
        self.add(&mut out, "action", action.as_str(), 2.0);
        Self::normalize(&mut out);
        out
    }
}

/// Dot product of two equally sized vectors.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Cosine distance in [0, 2]; 0 for identical directions.
pub fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na == 0.0 || nb == 0.0 {
        return if na == nb { 0.0 } else { 1.0 };
    }
    1.0 - dot(a, b) / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(problem: &str, trace: &[&str]) -> State {
        let mut s = State::new(problem);
        for step in trace {
            s = s.advance(&Action::new(*step));
        }
        s
    }

    #[test]
    fn features_are_deterministic_and_normalized() {
        let f = Featurizer::new(64);
        let s = state("What is 2 + 3?", &["add 2 and 3"]);
        let a = f.pair(&s, &Action::new("answer 5"));
        let b = f.pair(&s, &Action::new("answer 5"));
        assert_eq!(a, b);
        let norm = dot(&a, &a).sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn different_actions_give_different_features() {
        let f = Featurizer::new(128);
        let s = state("What is 2 + 3?", &[]);
        let a = f.pair(&s, &Action::new("answer 5"));
        let b = f.pair(&s, &Action::new("answer 6"));
        assert!(cosine_distance(&a, &b) > 1e-6);
    }

    #[test]
    fn cosine_distance_edges() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 0.0]), 1.0);
        assert!(cosine_distance(&[1.0, 2.0], &[2.0, 4.0]).abs() < 1e-12);
    }

    #[test]
    fn sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(20.0) > 0.999);
    }
}
