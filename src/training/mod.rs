//! Model-based training: the orchestration loop and what it needs.
//!
//! - [`trainer::RlTrainer`] -- collect, store, fit and update on a schedule.
//! - [`imagination`] -- synthetic rollouts through the world model.
//! - [`advantage`] -- returns, TD targets and clipped importance ratios.
//! - [`telemetry`] -- structured records of every phase.
//! - [`snapshot`] -- whole-trainer checkpoints.

pub mod advantage;
pub mod imagination;
pub mod snapshot;
pub mod telemetry;
pub mod trainer;

pub use snapshot::{TrainerCounters, TrainerSnapshot};
pub use telemetry::{JsonlWriter, Phase, TelemetryEvent, TelemetryLog, TelemetryRecord};
pub use trainer::{RlTrainer, RunSummary};
