// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{ChatMessage, Completion};

/// Errors surfaced by a model client.
///
/// `Transient` failures are retried with backoff by [`RetryingModel`];
/// everything else propagates to the caller immediately.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Rate limit, 5xx, or network failure.  Worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The request does not fit the model's context window and the history
    /// cannot be compacted further.
    #[error("context window exceeded")]
    ContextWindow,
    /// Unrecoverable provider error (bad credentials, malformed request).
    #[error("model failure: {0}")]
    Fatal(String),
}

/// The language model, treated as an opaque oracle: a conversation goes in,
/// reply text and usage accounting come out.
#[async_trait]
pub trait Model: Send + Sync {
    /// Model identifier as reported to users and trajectories.
    fn name(&self) -> &str;

    /// Send one query and wait for the full reply.
    async fn query(&self, messages: &[ChatMessage]) -> Result<Completion, ModelError>;
}

/// Wraps any model with exponential-backoff retries for transient failures.
///
/// The wrapper is itself a [`Model`], so it composes transparently wherever
/// an `Arc<dyn Model>` is expected.
pub struct RetryingModel {
    inner: std::sync::Arc<dyn Model>,
    max_retries: u32,
    base_delay: std::time::Duration,
}

impl RetryingModel {
    pub fn new(inner: std::sync::Arc<dyn Model>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            base_delay: std::time::Duration::from_millis(500),
        }
    }

    /// Override the first-retry delay.  Tests use a near-zero value.
    pub fn with_base_delay(mut self, base_delay: std::time::Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

#[async_trait]
impl Model for RetryingModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn query(&self, messages: &[ChatMessage]) -> Result<Completion, ModelError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.query(messages).await {
                Err(ModelError::Transient(reason)) if attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.pow(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient model failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::Usage;

    /// Fails with `Transient` for the first `fail_count` queries, then succeeds.
    struct FlakyModel {
        calls: AtomicU32,
        fail_count: u32,
    }

    #[async_trait]
    impl Model for FlakyModel {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn query(&self, _messages: &[ChatMessage]) -> Result<Completion, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_count {
                Err(ModelError::Transient("rate limited".into()))
            } else {
                Ok(Completion {
                    text: "ok".into(),
                    usage: Usage::default(),
                })
            }
        }
    }

    #[tokio::test]
    async fn retrying_model_recovers_from_transient_failures() {
        let inner = Arc::new(FlakyModel {
            calls: AtomicU32::new(0),
            fail_count: 2,
        });
        let m = RetryingModel::new(inner.clone(), 3).with_base_delay(Duration::from_millis(1));
        let completion = m.query(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(completion.text, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retrying_model_gives_up_after_budget() {
        let inner = Arc::new(FlakyModel {
            calls: AtomicU32::new(0),
            fail_count: 10,
        });
        let m = RetryingModel::new(inner.clone(), 2).with_base_delay(Duration::from_millis(1));
        let err = m.query(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, ModelError::Transient(_)));
        // 1 initial + 2 retries
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    struct FatalModel;

    #[async_trait]
    impl Model for FatalModel {
        fn name(&self) -> &str {
            "fatal"
        }
        async fn query(&self, _messages: &[ChatMessage]) -> Result<Completion, ModelError> {
            Err(ModelError::Fatal("bad credentials".into()))
        }
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let m = RetryingModel::new(Arc::new(FatalModel), 5)
            .with_base_delay(Duration::from_millis(1));
        let err = m.query(&[]).await.unwrap_err();
        assert!(matches!(err, ModelError::Fatal(_)));
    }
}
