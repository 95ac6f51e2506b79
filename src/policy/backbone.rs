//! Candidate-step proposers.
//!
//! - [`LlmBackbone`] asks an OpenAI-compatible chat model for next steps.
//! - [`ScriptedBackbone`] proposes the known solution step of a scripted
//!   problem among fixed distractors.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::ModelConfig;
use crate::env::reasoning::ScriptedProblem;
use crate::model::api::LlmClient;
use crate::model::prompt::{next_step_prompt, parse_candidates};
use crate::trajectory::types::{Action, State};

#[allow(async_fn_in_trait)]
pub trait Backbone: Send + Sync {
    /// Up to `n` distinct candidate next steps for `state`.
    async fn propose(&self, state: &State, n: usize) -> Result<Vec<Action>>;
}

// ---------------------------------------------------------------------------
// LLM backbone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmBackbone {
    client: LlmClient,
    model_id: String,
    temperature: f64,
    max_tokens: usize,
}

impl LlmBackbone {
    pub fn new(client: LlmClient, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
            temperature: 0.8,
            max_tokens: 256,
        }
    }

    pub fn from_config(config: &ModelConfig, request_timeout: Duration) -> Result<Self> {
        let client = LlmClient::new(
            &config.backbone_api_base,
            &config.backbone_api_key,
            request_timeout,
        )?;
        Ok(Self::new(client, config.backbone_model_id.clone()))
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

impl Backbone for LlmBackbone {
    async fn propose(&self, state: &State, n: usize) -> Result<Vec<Action>> {
        let messages = next_step_prompt(state);
        let resp = self
            .client
            .chat_completion(&self.model_id, &messages, self.temperature, self.max_tokens, n)
            .await
            .context("backbone propose failed")?;
        Ok(parse_candidates(&resp.texts(), n))
    }
}

// ---------------------------------------------------------------------------
// Scripted backbone
// ---------------------------------------------------------------------------

const DISTRACTORS: [&str; 4] = [
    "restate the problem",
    "guess the answer",
    "try a different approach",
    "answer: I don't know",
];

/// Offline proposer for [`ScriptedProblem`]s.
///
/// At each depth the expected step is placed among distractors, at a position
/// that rotates with depth so that candidate order carries no signal.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackbone {
    solutions: HashMap<String, Vec<String>>,
}

impl ScriptedBackbone {
    pub fn new(problems: &[ScriptedProblem]) -> Self {
        Self {
            solutions: problems
                .iter()
                .map(|p| (p.problem.clone(), p.steps.clone()))
                .collect(),
        }
    }
}

impl Backbone for ScriptedBackbone {
    async fn propose(&self, state: &State, n: usize) -> Result<Vec<Action>> {
        let n = n.max(1);
        let expected = self
            .solutions
            .get(&state.problem)
            .and_then(|steps| steps.get(state.depth()));

        let mut out: Vec<Action> = DISTRACTORS
            .iter()
            .take(if expected.is_some() { n - 1 } else { n })
            .map(|d| Action::new(*d))
            .collect();
        if let Some(step) = expected {
            let at = state.depth() % (out.len() + 1);
            out.insert(at, Action::new(step.as_str()));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// AnyBackbone
// ---------------------------------------------------------------------------

/// Enum dispatch over the concrete backbones.
#[derive(Debug, Clone)]
pub enum AnyBackbone {
    Llm(LlmBackbone),
    Scripted(ScriptedBackbone),
}

impl Backbone for AnyBackbone {
    async fn propose(&self, state: &State, n: usize) -> Result<Vec<Action>> {
        match self {
            Self::Llm(b) => b.propose(state, n).await,
            Self::Scripted(b) => b.propose(state, n).await,
        }
    }
}
