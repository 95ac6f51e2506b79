//! Experience records.
//!
//! - [`types::State`] and [`types::Action`] -- the reasoning context and one
//!   reasoning step.
//! - [`types::RealTransition`] -- an environment-observed step, the only record
//!   the replay buffer and world-model fitting accept.
//! - [`types::StoredTransition`] -- the snapshot form of a real transition.
//! - [`types::ImaginedTransition`] -- a world-model rollout step.
//! - [`types::Trajectory`] -- one episode being collected.

pub mod types;

pub use types::{Action, ImaginedTransition, RealTransition, State, StoredTransition, Trajectory};
