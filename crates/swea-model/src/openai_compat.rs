// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion adapter.
//!
//! Most hosted and local providers speak the same `/chat/completions` wire
//! format, so one adapter covers the lot.  The agent only needs a single
//! blocking query per turn — no streaming, no tool schemas on the wire; the
//! action surface is documented in the prompt and parsed from the reply text.

use serde_json::{json, Value};
use tracing::debug;

use crate::{ChatMessage, Completion, Model, ModelError, Usage};

pub struct OpenAiCompatModel {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    /// USD per 1k input / output tokens for cost accounting.
    price_per_1k: (f64, f64),
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    /// `base_url` ends before `/chat/completions`, e.g. `https://api.openai.com/v1`.
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        price_per_1k: (f64, f64),
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(2048),
            temperature: temperature.unwrap_or(0.0),
            price_per_1k,
            client: reqwest::Client::new(),
        }
    }

    fn cost_for(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let (input_rate, output_rate) = self.price_per_1k;
        (input_tokens as f64 / 1000.0) * input_rate + (output_tokens as f64 / 1000.0) * output_rate
    }
}

#[async_trait::async_trait]
impl Model for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn query(&self, messages: &[ChatMessage]) -> Result<Completion, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        debug!(url = %self.chat_url, model = %self.model, "chat completion request");
        let mut req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::Transient(format!("reading response body: {e}")))?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ModelError::Transient(format!("HTTP {status}: {text}")));
        }
        if !status.is_success() {
            if is_context_window_error(&text) {
                return Err(ModelError::ContextWindow);
            }
            return Err(ModelError::Fatal(format!("HTTP {status}: {text}")));
        }

        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| ModelError::Fatal(format!("malformed response JSON: {e}")))?;
        let reply = doc["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = doc["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = doc["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(Completion {
            text: reply,
            usage: Usage {
                input_tokens,
                output_tokens,
                cost: self.cost_for(input_tokens, output_tokens),
            },
        })
    }
}

/// Detect the provider-side refusal for an oversized request.
///
/// OpenAI reports `context_length_exceeded`; llama.cpp-compatible servers
/// report `exceed_context_size_error`; several proxies just say
/// "maximum context length".  All of them mean the same thing to the loop.
fn is_context_window_error(body: &str) -> bool {
    body.contains("context_length_exceeded")
        || body.contains("exceed_context_size_error")
        || body.contains("maximum context length")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_is_derived_from_base() {
        let m = OpenAiCompatModel::new(
            "gpt-4o".into(),
            None,
            "https://api.openai.com/v1/",
            None,
            None,
            (0.0, 0.0),
        );
        assert_eq!(m.chat_url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn cost_uses_per_1k_rates() {
        let m = OpenAiCompatModel::new(
            "gpt-4o".into(),
            None,
            "http://localhost:8080/v1",
            None,
            None,
            (0.002, 0.006),
        );
        let cost = m.cost_for(1000, 500);
        assert!((cost - (0.002 + 0.003)).abs() < 1e-9);
    }

    #[test]
    fn context_window_errors_are_recognised() {
        assert!(is_context_window_error(
            r#"{"error":{"code":"context_length_exceeded"}}"#
        ));
        assert!(is_context_window_error(
            r#"{"error":{"type":"exceed_context_size_error","n_ctx":4096}}"#
        ));
        assert!(is_context_window_error(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(!is_context_window_error(r#"{"error":"bad api key"}"#));
    }
}
