// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ChatMessage, Completion, Model, ModelError, Usage};

/// A pre-scripted deterministic model.  Each `query` pops the next reply
/// from the front of the queue.  This lets tests drive the agent loop with
/// exact reply sequences — including malformed ones — without network access.
pub struct ScriptedModel {
    replies: Mutex<Vec<String>>,
    /// Reply returned once the queue is drained.
    fallback: String,
    cost_per_call: f64,
    /// The last message list seen by this model, for test inspection.
    pub last_request: Arc<Mutex<Option<Vec<ChatMessage>>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies),
            fallback: String::new(),
            cost_per_call: 0.01,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// A model that returns the same reply on every call.
    pub fn always(reply: impl Into<String>) -> Self {
        let mut m = Self::new(Vec::new());
        m.fallback = reply.into();
        m
    }

    /// Override the cost charged per call (default 0.01 USD).
    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    /// Reply returned after the scripted queue is exhausted (default: empty).
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }
}

#[async_trait]
impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(&self, messages: &[ChatMessage]) -> Result<Completion, ModelError> {
        *self.last_request.lock().unwrap() = Some(messages.to_vec());
        let text = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                self.fallback.clone()
            } else {
                replies.remove(0)
            }
        };
        let input_tokens: u32 = messages.iter().map(|m| m.approx_tokens()).sum();
        let output_tokens = (text.len() as u32 / 4).max(1);
        Ok(Completion {
            text,
            usage: Usage {
                input_tokens,
                output_tokens,
                cost: self.cost_per_call,
            },
        })
    }
}

/// A model that immediately invokes the terminal tool.  Used to smoke-test
/// environment setup without spending any real turns.
pub struct InstantSubmitModel;

#[async_trait]
impl Model for InstantSubmitModel {
    fn name(&self) -> &str {
        "instant_submit"
    }

    async fn query(&self, messages: &[ChatMessage]) -> Result<Completion, ModelError> {
        let input_tokens: u32 = messages.iter().map(|m| m.approx_tokens()).sum();
        Ok(Completion {
            text: "Submitting without changes.\n```\nsubmit\n```".into(),
            usage: Usage {
                input_tokens,
                output_tokens: 8,
                cost: 0.0,
            },
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_pops_replies_in_order() {
        let m = ScriptedModel::new(vec!["one".into(), "two".into()]);
        assert_eq!(m.query(&[]).await.unwrap().text, "one");
        assert_eq!(m.query(&[]).await.unwrap().text, "two");
    }

    #[tokio::test]
    async fn scripted_falls_back_when_drained() {
        let m = ScriptedModel::new(vec!["only".into()]).with_fallback("done");
        let _ = m.query(&[]).await.unwrap();
        assert_eq!(m.query(&[]).await.unwrap().text, "done");
    }

    #[tokio::test]
    async fn always_returns_same_reply_forever() {
        let m = ScriptedModel::always("same");
        for _ in 0..3 {
            assert_eq!(m.query(&[]).await.unwrap().text, "same");
        }
    }

    #[tokio::test]
    async fn cost_per_call_is_charged() {
        let m = ScriptedModel::always("x").with_cost_per_call(0.5);
        let c = m.query(&[]).await.unwrap();
        assert!((c.usage.cost - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn last_request_records_messages() {
        let m = ScriptedModel::always("x");
        let _ = m.query(&[ChatMessage::user("probe")]).await.unwrap();
        let req = m.last_request.lock().unwrap();
        assert_eq!(req.as_ref().unwrap()[0].content, "probe");
    }

    #[tokio::test]
    async fn instant_submit_emits_submit_action() {
        let c = InstantSubmitModel.query(&[]).await.unwrap();
        assert!(c.text.contains("```\nsubmit\n```"));
        assert_eq!(c.usage.cost, 0.0);
    }
}
