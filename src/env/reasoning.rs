//! Multi-step reasoning environments.
//!
//! This module provides two implementations:
//! - [`LlmReasoningEnv`] connects to a reasoning task server via HTTP.
//! - [`MockReasoningEnv`] replays scripted problems for offline runs and tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing;

use super::traits::{Environment, StepOutcome, INVALID_ACTION_KEY};
use crate::trajectory::types::{Action, State};

// ---------------------------------------------------------------------------
// HTTP-backed reasoning environment
// ---------------------------------------------------------------------------

/// A reasoning environment served over HTTP.
///
/// The server is expected to expose two endpoints:
/// - `POST {base_url}/reset`  -- body: `{"task_id": <optional string>}`
/// - `POST {base_url}/step`   -- body: `{"action": "<reasoning step>"}`
///
/// Both return JSON matching [`ServerResponse`]. The server scores steps;
/// invalid steps are reported through `info.invalid_action`.
#[derive(Debug)]
pub struct LlmReasoningEnv {
    /// Base URL of the task server (e.g. `http://localhost:3000`).
    base_url: String,
    http: reqwest::Client,
    task_id: Option<String>,
    state: Option<State>,
    max_steps: usize,
    current_step: usize,
    done: bool,
}

/// The JSON shape returned by the task server.
#[derive(Debug, Deserialize)]
struct ServerResponse {
    problem: String,
    #[serde(default)]
    trace: Vec<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    reward: f64,
    #[serde(default)]
    info: Option<serde_json::Value>,
}

impl LlmReasoningEnv {
    pub fn new(base_url: &str, max_steps: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            task_id: None,
            state: None,
            max_steps,
            current_step: 0,
            done: false,
        }
    }

    /// Pin every reset to one task.
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

impl Environment for LlmReasoningEnv {
    async fn reset(&mut self) -> Result<State> {
        self.current_step = 0;
        self.done = false;

        let body = serde_json::json!({ "task_id": self.task_id });
        let resp: ServerResponse = self
            .http
            .post(format!("{}/reset", self.base_url))
            .json(&body)
            .send()
            .await
            .context("failed to reach reasoning server on reset")?
            .error_for_status()
            .context("reasoning server rejected reset")?
            .json()
            .await
            .context("failed to parse reasoning reset response")?;

        let state = State {
            problem: resp.problem,
            trace: resp.trace,
        };
        tracing::debug!(problem = %state.problem, "reasoning env reset");
        self.state = Some(state.clone());
        Ok(state)
    }

    async fn step(&mut self, action: &Action) -> Result<StepOutcome> {
        if self.done {
            anyhow::bail!("cannot step in a terminated episode");
        }
        let Some(current) = self.state.as_ref() else {
            anyhow::bail!("step called before reset");
        };
        let problem = current.problem.clone();

        self.current_step += 1;

        let body = serde_json::json!({ "action": action.as_str() });
        let resp: ServerResponse = self
            .http
            .post(format!("{}/step", self.base_url))
            .json(&body)
            .send()
            .await
            .context("failed to reach reasoning server on step")?
            .error_for_status()
            .context("reasoning server rejected step")?
            .json()
            .await
            .context("failed to parse reasoning step response")?;

        if resp.problem != problem {
            anyhow::bail!(
                "reasoning server switched problem mid-episode ({:?} -> {:?})",
                problem,
                resp.problem
            );
        }

        let truncated = self.current_step >= self.max_steps;
        let episode_done = resp.done || truncated;
        self.done = episode_done;

        let state = State {
            problem: resp.problem,
            trace: resp.trace,
        };
        self.state = Some(state.clone());

        Ok(StepOutcome {
            state,
            reward: resp.reward,
            done: episode_done,
            info: resp.info.unwrap_or(serde_json::Value::Null),
        })
    }

    fn max_steps(&self) -> usize {
        self.max_steps
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// Scripted problems
// ---------------------------------------------------------------------------

/// A problem with a known step-by-step solution and per-step rewards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedProblem {
    pub problem: String,
    /// The expected reasoning step at each depth.
    pub steps: Vec<String>,
    /// Reward for taking the expected step at each depth.
    pub rewards: Vec<f64>,
}

impl ScriptedProblem {
    pub fn new(problem: &str, steps: &[&str]) -> Self {
        let mut rewards = vec![0.0; steps.len()];
        if let Some(last) = rewards.last_mut() {
            *last = 1.0;
        }
        Self {
            problem: problem.into(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            rewards,
        }
    }

    /// Whether `action` is the expected step at `depth`.
    pub fn accepts(&self, depth: usize, action: &Action) -> bool {
        self.steps
            .get(depth)
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(action.as_str().trim()))
    }
}

/// The built-in problem set: three-step arithmetic word problems whose reward
/// schedule is `[0, 0, 1]`.
pub fn default_problems() -> Vec<ScriptedProblem> {
    vec![
        ScriptedProblem::new(
            "What is 17 + 25?",
            &[
                "add the tens: 10 + 20 = 30",
                "add the ones: 7 + 5 = 12",
                "answer: 30 + 12 = 42",
            ],
        ),
        ScriptedProblem::new(
            "A train travels 60 km per hour for 3 hours. How far does it go?",
            &[
                "distance is speed times time",
                "multiply: 60 * 3 = 180",
                "answer: 180 km",
            ],
        ),
        ScriptedProblem::new(
            "Sam has 4 boxes of 6 apples and eats 5. How many are left?",
            &[
                "count the apples: 4 * 6 = 24",
                "subtract the eaten ones: 24 - 5 = 19",
                "answer: 19 apples",
            ],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Mock reasoning environment for testing
// ---------------------------------------------------------------------------

/// A scripted reasoning environment that cycles through fixed problems.
///
/// Every step appends the action to the trace and advances one depth, so an
/// episode always lasts exactly as many steps as the script (capped by
/// `max_steps`). The expected step earns the scripted reward; any other step
/// earns `-penalty` and is flagged invalid in `info`.
#[derive(Debug, Clone)]
pub struct MockReasoningEnv {
    problems: Vec<ScriptedProblem>,
    problem_index: usize,
    state: Option<State>,
    penalty: f64,
    max_steps: usize,
    done: bool,
    /// Fail every n-th step call (1-based), for exercising recovery paths.
    fail_every: Option<usize>,
    step_calls: usize,
}

impl MockReasoningEnv {
    pub fn new() -> Self {
        Self::with_problems(default_problems())
    }

    pub fn with_problems(problems: Vec<ScriptedProblem>) -> Self {
        Self {
            problems,
            problem_index: 0,
            state: None,
            penalty: 0.1,
            max_steps: 32,
            done: false,
            fail_every: None,
            step_calls: 0,
        }
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Make every `n`-th call to `step` return a transport error.
    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    pub fn problems(&self) -> &[ScriptedProblem] {
        &self.problems
    }

    fn current_problem(&self) -> Option<&ScriptedProblem> {
        if self.problems.is_empty() {
            return None;
        }
        Some(&self.problems[self.problem_index % self.problems.len()])
    }
}

impl Default for MockReasoningEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for MockReasoningEnv {
    async fn reset(&mut self) -> Result<State> {
        let problem = self
            .current_problem()
            .context("mock reasoning env has no problems")?;
        let state = State::new(problem.problem.clone());
        self.state = Some(state.clone());
        self.done = false;
        Ok(state)
    }

    async fn step(&mut self, action: &Action) -> Result<StepOutcome> {
        if self.done {
            anyhow::bail!("cannot step in a terminated episode");
        }
        let state = self.state.clone().context("step called before reset")?;

        self.step_calls += 1;
        if let Some(n) = self.fail_every {
            if self.step_calls % n == 0 {
                anyhow::bail!("mock transport failure on step call {}", self.step_calls);
            }
        }

        let problem = self
            .current_problem()
            .context("mock reasoning env has no problems")?;
        let depth = state.depth();
        let valid = problem.accepts(depth, action);
        let reward = if valid {
            problem.rewards.get(depth).copied().unwrap_or(0.0)
        } else {
            -self.penalty
        };
        let scripted_end = depth + 1 >= problem.steps.len();
        let truncated = depth + 1 >= self.max_steps;
        let done = scripted_end || truncated;

        let next = state.advance(action);
        let info = serde_json::json!({
            INVALID_ACTION_KEY: !valid,
            "expected_step": problem.steps.get(depth),
            "problem_index": self.problem_index,
        });

        self.state = Some(next.clone());
        self.done = done;
        if done {
            self.problem_index += 1;
        }

        Ok(StepOutcome {
            state: next,
            reward,
            done,
            info,
        })
    }

    fn max_steps(&self) -> usize {
        self.max_steps
    }

    fn is_done(&self) -> bool {
        self.done
    }
}
