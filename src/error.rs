//! Error taxonomy for the training core.
//!
//! Only [`RlrError::ContractViolation`] is fatal for a run; every other
//! variant is recovered at the boundary that can act on it (the trainer skips
//! a phase or ends an episode early).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RlrError {
    /// A sample was requested before enough transitions were collected.
    #[error("insufficient data: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },

    /// Shape/type mismatch between components, or an invalid configuration.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// World model loss stayed above the ceiling, or produced non-finite output.
    #[error("model divergence: loss {loss} (ceiling {ceiling}, {consecutive} consecutive fits)")]
    ModelDivergence {
        loss: f64,
        ceiling: f64,
        consecutive: usize,
    },

    /// An environment step failed; the episode was ended early.
    #[error("episode aborted: {0}")]
    EpisodeAborted(String),

    /// A collaborator call did not finish within its limit.
    #[error("{operation} timed out after {limit_ms} ms")]
    Timeout { operation: String, limit_ms: u64 },

    /// A backbone or transport failure surfaced through a component contract.
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl RlrError {
    /// Whether this error must halt a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }

    /// A world model produced a non-finite number.
    pub fn non_finite(value: f64) -> Self {
        Self::ModelDivergence {
            loss: value,
            ceiling: f64::INFINITY,
            consecutive: 0,
        }
    }

    /// Wrap an `anyhow` error coming from a collaborator adapter.
    pub fn collaborator(err: anyhow::Error) -> Self {
        Self::Collaborator(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, RlrError>;
