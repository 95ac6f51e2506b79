//! rlr: model-based reinforcement learning for LLM reasoning policies.
//!
//! A reasoning policy ranks candidate steps proposed by an LLM backbone. Real
//! experience from a reasoning environment goes into a replay buffer; a
//! learned world model is fitted on it and used both to plan actions and to
//! imagine extra training data for the policy.

pub mod buffer;
pub mod config;
pub mod env;
pub mod error;
pub mod features;
pub mod model;
pub mod planner;
pub mod policy;
pub mod training;
pub mod trajectory;
pub mod world_model;

pub use error::{Result, RlrError};
