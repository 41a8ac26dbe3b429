// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ChatMessage, Completion, Model, ModelError, Usage};

/// Replays the assistant turns of a previously recorded trajectory file.
///
/// Each query pops the next assistant turn and re-emits it in the
/// thought/action block format, so a recorded run can be reproduced against
/// a fresh environment (and, with a deterministic environment, must produce
/// an identical trajectory).
pub struct ReplayModel {
    replies: Mutex<Vec<String>>,
}

impl ReplayModel {
    /// Load the assistant turns from a `.traj.json` file.
    ///
    /// The file is read generically so this crate does not depend on the
    /// trajectory types: any JSON document with a `history` array of
    /// `{role, thought, action: {command}}` objects is accepted.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&text)?;
        let history = doc["history"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("{}: no history array", path.display()))?;

        let mut replies = Vec::new();
        for turn in history {
            if turn["role"].as_str() != Some("assistant") {
                continue;
            }
            let thought = turn["thought"].as_str().unwrap_or_default();
            match turn["action"]["command"].as_str() {
                Some(command) => replies.push(format!("{thought}\n```\n{command}\n```")),
                // A recorded parse failure has no action; replay the raw
                // thought so the retry protocol fires the same way.
                None => replies.push(thought.to_string()),
            }
        }
        if replies.is_empty() {
            anyhow::bail!("{}: no assistant turns to replay", path.display());
        }
        Ok(Self {
            replies: Mutex::new(replies),
        })
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl Model for ReplayModel {
    fn name(&self) -> &str {
        "replay"
    }

    async fn query(&self, _messages: &[ChatMessage]) -> Result<Completion, ModelError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(ModelError::Fatal(
                "replay exhausted: the recorded trajectory has no more assistant turns".into(),
            ));
        }
        let text = replies.remove(0);
        let output_tokens = (text.len() as u32 / 4).max(1);
        Ok(Completion {
            text,
            usage: Usage {
                input_tokens: 0,
                output_tokens,
                cost: 0.0,
            },
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_traj(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{json}").unwrap();
        f
    }

    #[tokio::test]
    async fn replays_assistant_turns_in_order() {
        let f = write_traj(
            r#"{"history": [
                {"role": "system", "thought": ""},
                {"role": "assistant", "thought": "look around", "action": {"command": "ls"}},
                {"role": "tool_observation", "thought": ""},
                {"role": "assistant", "thought": "done", "action": {"command": "submit"}}
            ]}"#,
        );
        let m = ReplayModel::from_file(f.path()).unwrap();
        assert_eq!(m.remaining(), 2);
        let first = m.query(&[]).await.unwrap();
        assert!(first.text.contains("look around"));
        assert!(first.text.contains("```\nls\n```"));
        let second = m.query(&[]).await.unwrap();
        assert!(second.text.contains("```\nsubmit\n```"));
    }

    #[tokio::test]
    async fn exhausted_replay_is_fatal() {
        let f = write_traj(
            r#"{"history": [{"role": "assistant", "thought": "t", "action": {"command": "submit"}}]}"#,
        );
        let m = ReplayModel::from_file(f.path()).unwrap();
        let _ = m.query(&[]).await.unwrap();
        assert!(matches!(m.query(&[]).await, Err(ModelError::Fatal(_))));
    }

    #[test]
    fn missing_history_is_an_error() {
        let f = write_traj(r#"{"status": "submitted"}"#);
        assert!(ReplayModel::from_file(f.path()).is_err());
    }

    #[test]
    fn trajectory_without_assistant_turns_is_an_error() {
        let f = write_traj(r#"{"history": [{"role": "system", "thought": ""}]}"#);
        assert!(ReplayModel::from_file(f.path()).is_err());
    }

    #[tokio::test]
    async fn parse_failure_turn_replays_raw_thought() {
        let f = write_traj(
            r#"{"history": [{"role": "assistant", "thought": "garbled reply", "action": null}]}"#,
        );
        let m = ReplayModel::from_file(f.path()).unwrap();
        let c = m.query(&[]).await.unwrap();
        assert_eq!(c.text, "garbled reply");
    }
}
