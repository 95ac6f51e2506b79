//! Training telemetry.
//!
//! The trainer emits plain [`TelemetryRecord`]s into a [`TelemetryLog`], which
//! mirrors each one to `tracing`, streams it to an attached [`JsonlWriter`]
//! and keeps only the most recent ones in memory.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::policy::UpdateStats;
use crate::world_model::FitStats;

/// Loop phase named in skip records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reset,
    Act,
    Plan,
    Fit,
    Update,
    Imagine,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::Act => "act",
            Self::Plan => "plan",
            Self::Fit => "fit",
            Self::Update => "update",
            Self::Imagine => "imagine",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Fit(FitStats),
    Update(UpdateStats),
    Episode {
        episode_id: String,
        episode_return: f64,
        steps: usize,
        aborted: bool,
    },
    Plan {
        value: f64,
        depth: usize,
        nodes: usize,
        confidence: f64,
    },
    PhaseSkipped {
        phase: Phase,
        reason: String,
    },
    Divergence {
        loss: f64,
        consecutive: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    /// Real transitions collected when the record was emitted.
    pub transitions: usize,
    #[serde(flatten)]
    pub event: TelemetryEvent,
}

/// Records kept in memory when no retention is configured.
const DEFAULT_RETAIN: usize = 4096;

/// Bounded record log with an optional file sink.
#[derive(Debug)]
pub struct TelemetryLog {
    records: VecDeque<TelemetryRecord>,
    retain: usize,
    sink: Option<JsonlWriter>,
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAIN)
    }
}

impl TelemetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retain` records in memory; older ones are dropped after
    /// reaching the sink, if any.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            records: VecDeque::new(),
            retain,
            sink: None,
        }
    }

    /// Stream every subsequent record to `sink`.
    pub fn attach_sink(&mut self, sink: JsonlWriter) {
        self.sink = Some(sink);
    }

    /// Flush the sink, if one is attached.
    pub fn flush(&mut self) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }

    pub fn record(&mut self, transitions: usize, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::Fit(s) => info!(
                transitions,
                loss = s.loss,
                prediction_error = s.prediction_error,
                samples = s.samples,
                "world model fitted"
            ),
            TelemetryEvent::Update(s) => info!(
                transitions,
                loss = s.loss,
                mean_ratio = s.mean_ratio,
                clip_fraction = s.clip_fraction,
                samples = s.samples,
                "policy updated"
            ),
            TelemetryEvent::Episode {
                episode_id,
                episode_return,
                steps,
                aborted,
            } => info!(
                transitions,
                episode = %episode_id,
                episode_return,
                steps,
                aborted,
                "episode collected"
            ),
            TelemetryEvent::Plan {
                value,
                depth,
                nodes,
                confidence,
            } => debug!(value, depth, nodes, confidence, "planned action"),
            TelemetryEvent::PhaseSkipped { phase, reason } => {
                warn!(transitions, %phase, reason = %reason, "phase skipped")
            }
            TelemetryEvent::Divergence { loss, consecutive } => {
                warn!(transitions, loss, consecutive, "world model diverging")
            }
        }

        let record = TelemetryRecord {
            timestamp: Utc::now(),
            transitions,
            event,
        };
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(&record) {
                warn!(error = %format!("{e:#}"), "telemetry sink failed, detaching");
                self.sink = None;
            }
        }

        self.records.push_back(record);
        while self.records.len() > self.retain {
            self.records.pop_front();
        }
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, pred: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.event)).count()
    }
}

/// JSON-lines file sink.
#[derive(Debug)]
pub struct JsonlWriter {
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Open `path` for appending, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open telemetry file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, record: &TelemetryRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize telemetry record")?;
        writeln!(self.writer, "{line}").context("failed to write telemetry record")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush telemetry file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_tagged_and_flattened() {
        let mut log = TelemetryLog::new();
        log.record(
            12,
            TelemetryEvent::PhaseSkipped {
                phase: Phase::Fit,
                reason: "insufficient data".into(),
            },
        );
        let first = log.records().next().unwrap().clone();
        let json = serde_json::to_value(&first).unwrap();
        assert_eq!(json["kind"], "phase_skipped");
        assert_eq!(json["phase"], "fit");
        assert_eq!(json["transitions"], 12);

        let back: TelemetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, first);
    }

    #[test]
    fn count_by_event_kind() {
        let mut log = TelemetryLog::new();
        log.record(1, TelemetryEvent::Fit(FitStats::default()));
        log.record(2, TelemetryEvent::Update(UpdateStats::default()));
        log.record(3, TelemetryEvent::Fit(FitStats::default()));
        assert_eq!(log.count(|e| matches!(e, TelemetryEvent::Fit(_))), 2);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn retention_drops_oldest_records() {
        let mut log = TelemetryLog::with_retention(2);
        for t in 1..=5 {
            log.record(t, TelemetryEvent::Fit(FitStats::default()));
        }
        assert_eq!(log.len(), 2);
        let kept: Vec<usize> = log.records().map(|r| r.transitions).collect();
        assert_eq!(kept, vec![4, 5]);
    }

    #[test]
    fn sink_receives_records_beyond_retention() {
        let dir = std::env::temp_dir().join(format!("rlr-telemetry-{}", uuid::Uuid::new_v4()));
        let path = dir.join("run.jsonl");
        let mut log = TelemetryLog::with_retention(1);
        log.attach_sink(JsonlWriter::open(&path).unwrap());
        log.record(
            3,
            TelemetryEvent::Episode {
                episode_id: "e1".into(),
                episode_return: 1.0,
                steps: 3,
                aborted: false,
            },
        );
        log.record(
            3,
            TelemetryEvent::Divergence {
                loss: 2e3,
                consecutive: 3,
            },
        );

        log.flush().unwrap();
        assert_eq!(log.len(), 1);

        // A second writer on the same file appends.
        let mut again = JsonlWriter::open(&path).unwrap();
        again.write(log.records().next().unwrap()).unwrap();
        again.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: TelemetryRecord = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(first.event, TelemetryEvent::Episode { .. }));
        let last: TelemetryRecord = serde_json::from_str(lines[2]).unwrap();
        assert!(matches!(last.event, TelemetryEvent::Divergence { .. }));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
