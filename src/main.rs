//! rlr: model-based RL for LLM reasoning policies.
//!
//! - `train`    -- Train a fresh policy and world model
//! - `resume`   -- Continue training from a saved snapshot
//! - `inspect`  -- Summarize a saved snapshot

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rlr::config::Config;
use rlr::env::{AnyEnv, LlmReasoningEnv, MockReasoningEnv};
use rlr::policy::{AnyBackbone, LlmBackbone, PolicySnapshot, ReasoningPolicy, ScriptedBackbone};
use rlr::training::{JsonlWriter, RlTrainer, RunSummary, TrainerSnapshot};
use rlr::world_model::{LearnedWorldModel, WorldModelSnapshot};

type Trainer = RlTrainer<LearnedWorldModel, ReasoningPolicy<AnyBackbone>>;
type Snapshot = TrainerSnapshot<WorldModelSnapshot, PolicySnapshot>;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Model-based RL for LLM reasoning policies
#[derive(Parser)]
#[command(name = "rlr", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where experience and candidate steps come from.
#[derive(clap::Args, Clone, Debug)]
struct Sources {
    /// Reasoning task server URL. Uses the scripted mock environment if unset.
    #[arg(long)]
    env_url: Option<String>,

    /// Pin every episode on the task server to one task.
    #[arg(long, requires = "env_url")]
    task: Option<String>,

    /// Ask the configured chat model for candidate steps instead of the
    /// scripted proposer.
    #[arg(long)]
    llm_backbone: bool,

    /// Sampling temperature for backbone proposals.
    #[arg(long, requires = "llm_backbone")]
    backbone_temperature: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train from scratch.
    Train {
        #[arg(long, default_value_t = 100)]
        episodes: usize,

        /// Overrides `training.seed`.
        #[arg(long)]
        seed: Option<u64>,

        /// Route action selection through the planner.
        #[arg(long)]
        planning: bool,

        #[command(flatten)]
        sources: Sources,

        /// Where to save the trainer snapshot.
        #[arg(long, default_value = "data/snapshot.json")]
        snapshot: PathBuf,

        /// Telemetry JSON-lines output (overrides `logging.telemetry_path`).
        #[arg(long)]
        telemetry: Option<PathBuf>,
    },

    /// Load a snapshot and keep training with its configuration.
    Resume {
        /// Snapshot produced by `train` or `resume`.
        path: PathBuf,

        #[arg(long, default_value_t = 100)]
        episodes: usize,

        #[command(flatten)]
        sources: Sources,

        /// Where to save the new snapshot (defaults to overwriting `path`).
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        telemetry: Option<PathBuf>,
    },

    /// Summarize a saved snapshot.
    Inspect {
        #[arg(default_value = "data/snapshot.json")]
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<Config>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => Config::default(),
    };
    fill_api_key(&mut config);

    // RUST_LOG wins over the configured filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    match cli.command {
        Commands::Train {
            episodes,
            seed,
            planning,
            sources,
            snapshot,
            telemetry,
        } => {
            if let Some(seed) = seed {
                config.training.seed = seed;
            }
            if planning {
                config.training.use_planning = true;
            }
            if telemetry.is_some() {
                config.logging.telemetry_path = telemetry;
            }
            cmd_train(config, &sources, episodes, &snapshot).await
        }
        Commands::Resume {
            path,
            episodes,
            sources,
            output,
            telemetry,
        } => {
            let output = output.unwrap_or_else(|| path.clone());
            cmd_resume(&path, &sources, episodes, &output, telemetry).await
        }
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

fn fill_api_key(config: &mut Config) {
    if config.model.backbone_api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.model.backbone_api_key = key;
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: Config, sources: &Sources, episodes: usize, snapshot: &Path) -> Result<()> {
    tracing::info!(episodes, seed = config.training.seed, "Starting training");

    let mut env = create_env(sources, &config);
    let mut trainer = build_trainer(config, sources)?;
    let summary = trainer.run(&mut env, episodes).await?;

    finish(&trainer, &summary, snapshot)
}

async fn cmd_resume(
    path: &Path,
    sources: &Sources,
    episodes: usize,
    output: &Path,
    telemetry: Option<PathBuf>,
) -> Result<()> {
    let saved = Snapshot::load_from_file(path)?;
    let mut config = saved.config.clone();
    fill_api_key(&mut config);
    if telemetry.is_some() {
        config.logging.telemetry_path = telemetry;
    }
    tracing::info!(
        episodes,
        resumed_from = saved.counters.episodes,
        "Resuming training"
    );

    let mut env = create_env(sources, &config);
    let mut trainer = build_trainer(config, sources)?;
    trainer.import_state(saved)?;
    let summary = trainer.run(&mut env, episodes).await?;

    finish(&trainer, &summary, output)
}

/// Persist the snapshot after a run. Telemetry was streamed during it.
fn finish(trainer: &Trainer, summary: &RunSummary, snapshot: &Path) -> Result<()> {
    if let Some(parent) = snapshot.parent() {
        std::fs::create_dir_all(parent)?;
    }
    trainer.save_snapshot(snapshot)?;

    tracing::info!(
        episodes = summary.episodes,
        mean_return = format!("{:.3}", summary.mean_return),
        fits = summary.fits,
        updates = summary.updates,
        buffer = summary.buffer_size,
        "Training finished"
    );
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let snapshot = Snapshot::load_from_file(path)?;
    let c = &snapshot.counters;

    println!("Snapshot: {}", path.display());
    println!(
        "  Created: {}",
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Episodes: {}", c.episodes);
    println!("  Transitions collected: {}", c.transitions);
    println!(
        "  Fits: {} ({} skipped), updates: {} ({} skipped)",
        c.fits, c.fits_skipped, c.updates, c.updates_skipped
    );
    println!();

    let buffer = &snapshot.buffer;
    println!("Replay buffer:");
    println!(
        "  {} / {} records, {:?} eviction",
        buffer.entries.len(),
        buffer.capacity,
        buffer.eviction
    );
    let rewards: Vec<f64> = buffer.entries.iter().map(|e| e.transition.reward()).collect();
    if !rewards.is_empty() {
        let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
        println!("  Mean stored reward: {mean:.3}");
    }
    println!();

    let wm = &snapshot.world_model;
    println!("World model:");
    println!("  Feature dim: {}", wm.feature_dim);
    println!("  Memorized states: {}", wm.memory.len());
    println!(
        "  Error EMA: reward {:.4}, done {:.4}, state {:.4} over {} fits",
        wm.stats.reward_error_ema,
        wm.stats.done_error_ema,
        wm.stats.state_divergence_ema,
        wm.stats.fits
    );
    println!();

    let policy = &snapshot.policy;
    println!("Policy:");
    println!("  Feature dim: {}", policy.feature_dim);
    println!("  Value bias: {:.4}", policy.value_bias);
    println!("  Cached candidate sets: {}", policy.candidate_cache.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

fn create_env(sources: &Sources, config: &Config) -> AnyEnv {
    match &sources.env_url {
        Some(url) => {
            tracing::info!(url = %url, task = ?sources.task, "Using live reasoning environment");
            let env = LlmReasoningEnv::new(url, config.training.max_episode_steps);
            AnyEnv::Http(match &sources.task {
                Some(task) => env.with_task(task.clone()),
                None => env,
            })
        }
        None => {
            tracing::info!("Using scripted mock reasoning environment");
            AnyEnv::Mock(MockReasoningEnv::new().with_penalty(config.training.invalid_action_penalty))
        }
    }
}

fn build_trainer(config: Config, sources: &Sources) -> Result<Trainer> {
    let backbone = if sources.llm_backbone {
        let timeout = Duration::from_millis(config.training.step_timeout_ms);
        let llm = LlmBackbone::from_config(&config.model, timeout)?;
        AnyBackbone::Llm(match sources.backbone_temperature {
            Some(t) => llm.with_temperature(t),
            None => llm,
        })
    } else {
        AnyBackbone::Scripted(ScriptedBackbone::new(MockReasoningEnv::new().problems()))
    };
    let world_model = LearnedWorldModel::from_config(&config.model);
    let policy = ReasoningPolicy::from_config(backbone, &config);
    let mut trainer = RlTrainer::new(config, world_model, policy)?;

    if let Some(path) = trainer.config().logging.telemetry_path.clone() {
        trainer.telemetry_mut().attach_sink(JsonlWriter::open(&path)?);
        tracing::info!(path = %path.display(), "Streaming telemetry");
    }
    Ok(trainer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn task_and_temperature_flags_reach_sources() {
        let cli = Cli::try_parse_from([
            "rlr",
            "train",
            "--env-url",
            "http://localhost:9000",
            "--task",
            "gsm8k-17",
            "--llm-backbone",
            "--backbone-temperature",
            "0.3",
        ])
        .unwrap();
        let Commands::Train { sources, .. } = cli.command else {
            panic!("expected train");
        };
        assert_eq!(sources.task.as_deref(), Some("gsm8k-17"));
        assert_eq!(sources.backbone_temperature, Some(0.3));
        assert!(matches!(create_env(&sources, &Config::default()), AnyEnv::Http(_)));
    }

    #[test]
    fn task_without_server_is_rejected() {
        assert!(Cli::try_parse_from(["rlr", "train", "--task", "gsm8k-17"]).is_err());
    }

    #[tokio::test]
    async fn configured_telemetry_streams_during_the_run() {
        let dir = std::env::temp_dir().join(format!("rlr-main-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.logging.telemetry_path = Some(dir.join("telemetry.jsonl"));
        let sources = Sources {
            env_url: None,
            task: None,
            llm_backbone: false,
            backbone_temperature: None,
        };

        let mut trainer = build_trainer(config, &sources).unwrap();
        trainer.run(&mut MockReasoningEnv::new(), 2).await.unwrap();

        // Readable before the trainer is dropped or saved.
        let text = std::fs::read_to_string(dir.join("telemetry.jsonl")).unwrap();
        let episodes = text
            .lines()
            .filter(|l| l.contains("\"kind\":\"episode\""))
            .count();
        assert_eq!(episodes, 2);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
