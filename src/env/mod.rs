//! Reasoning environment abstractions and concrete implementations.
//!
//! Every environment implements the [`Environment`] trait so that the trainer
//! can interact with it uniformly.
//!
//! Included environments:
//! - [`reasoning::LlmReasoningEnv`] -- HTTP task server that scores reasoning
//!   steps.
//! - [`reasoning::MockReasoningEnv`] -- scripted three-step problems for
//!   offline runs and tests.

pub mod reasoning;
pub mod traits;

pub use reasoning::{default_problems, LlmReasoningEnv, MockReasoningEnv, ScriptedProblem};
pub use traits::{Environment, StepOutcome, INVALID_ACTION_KEY};

use crate::trajectory::types::{Action, State};

// ---------------------------------------------------------------------------
// AnyEnv: enum dispatch wrapper for dynamic environment selection
// ---------------------------------------------------------------------------

/// An enum wrapper around all concrete environment types, enabling runtime
/// environment selection without `dyn` (which is incompatible with async trait
/// methods).
pub enum AnyEnv {
    Http(LlmReasoningEnv),
    Mock(MockReasoningEnv),
}

impl Environment for AnyEnv {
    async fn reset(&mut self) -> anyhow::Result<State> {
        match self {
            Self::Http(e) => e.reset().await,
            Self::Mock(e) => e.reset().await,
        }
    }

    async fn step(&mut self, action: &Action) -> anyhow::Result<StepOutcome> {
        match self {
            Self::Http(e) => e.step(action).await,
            Self::Mock(e) => e.step(action).await,
        }
    }

    fn max_steps(&self) -> usize {
        match self {
            Self::Http(e) => e.max_steps(),
            Self::Mock(e) => e.max_steps(),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Self::Http(e) => e.is_done(),
            Self::Mock(e) => e.is_done(),
        }
    }
}
