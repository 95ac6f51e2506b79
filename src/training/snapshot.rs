//! Whole-trainer checkpoints.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferSnapshot;
use crate::config::Config;
use crate::planner::SimplePlanner;

/// Loop progress carried across a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerCounters {
    pub episodes: usize,
    /// Real transitions collected over the trainer's lifetime.
    pub transitions: usize,
    /// Transitions since the last fit / update attempt.
    pub since_fit: usize,
    pub since_update: usize,
    pub fits: usize,
    pub updates: usize,
    pub fits_skipped: usize,
    pub updates_skipped: usize,
    /// Consecutive fits with loss above the divergence ceiling.
    pub divergence_streak: usize,
}

/// Every learned and random component of an [`super::RlTrainer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSnapshot<WS, PS> {
    pub created_at: DateTime<Utc>,
    pub config: Config,
    pub counters: TrainerCounters,
    pub buffer: BufferSnapshot,
    pub world_model: WS,
    pub policy: PS,
    pub planner: SimplePlanner,
}

impl<WS, PS> TrainerSnapshot<WS, PS>
where
    WS: Serialize + DeserializeOwned,
    PS: Serialize + DeserializeOwned,
{
    /// Serialize the snapshot to a pretty-printed JSON file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize trainer snapshot to JSON")?;
        std::fs::write(path.as_ref(), json).with_context(|| {
            format!(
                "Failed to write trainer snapshot to {}",
                path.as_ref().display()
            )
        })?;
        tracing::info!(
            path = %path.as_ref().display(),
            transitions = self.buffer.entries.len(),
            episodes = self.counters.episodes,
            "Saved trainer snapshot"
        );
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "Failed to read trainer snapshot from {}",
                path.as_ref().display()
            )
        })?;
        let snapshot: Self = serde_json::from_str(&data)
            .context("Failed to deserialize trainer snapshot JSON")?;
        tracing::info!(
            path = %path.as_ref().display(),
            transitions = snapshot.buffer.entries.len(),
            episodes = snapshot.counters.episodes,
            "Loaded trainer snapshot"
        );
        Ok(snapshot)
    }
}
