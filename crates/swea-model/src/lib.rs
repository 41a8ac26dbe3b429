// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod cost;
mod openai_compat;
mod replay;
mod scripted;
mod types;

use std::sync::Arc;

pub use client::{Model, ModelError, RetryingModel};
pub use cost::{CostExceeded, CostScope, CostTracker};
pub use openai_compat::OpenAiCompatModel;
pub use replay::ReplayModel;
pub use scripted::{InstantSubmitModel, ScriptedModel};
pub use types::{ChatMessage, ChatRole, Completion, Usage};

use swea_config::ModelConfig;

/// Build a model client from configuration, wrapped with transient-failure
/// retries.  Reserved names select the deterministic providers:
///
/// - `instant_submit` — submits on the first turn (environment smoke tests)
/// - `replay` — replays `model.replay_path`
///
/// Anything else is treated as a model id for the OpenAI-compatible adapter.
pub fn from_config(config: &ModelConfig) -> anyhow::Result<Arc<dyn Model>> {
    let inner: Arc<dyn Model> = match config.name.as_str() {
        "instant_submit" => Arc::new(InstantSubmitModel),
        "replay" => {
            let path = config
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("model.replay_path required for replay model"))?;
            Arc::new(ReplayModel::from_file(path)?)
        }
        _ => {
            let api_key = config
                .api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            let base_url = config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into());
            Arc::new(OpenAiCompatModel::new(
                config.name.clone(),
                api_key,
                &base_url,
                config.max_output_tokens,
                config.temperature,
                (config.cost_per_1k_input, config.cost_per_1k_output),
            ))
        }
    };
    Ok(Arc::new(RetryingModel::new(inner, config.max_retries)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
