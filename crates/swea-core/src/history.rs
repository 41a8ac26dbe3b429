// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use swea_config::HistoryProcessorConfig;
use swea_model::ChatMessage;

use crate::trajectory::{Role, Turn};

/// History processing before each model query.
///
/// The set of behaviours is closed and enumerable: identity, observation
/// elision, retry-drop, and composition.  Processors are pure — they read a
/// turn list and return a transformed copy; the persisted trajectory is
/// never touched.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryProcessor {
    /// Send everything verbatim.
    Identity,
    /// Keep the last `keep_last` observations in full; replace older ones
    /// with a one-line placeholder naming the tool.  Reasoning turns are
    /// always kept, so the chain of thought stays intact while old tool
    /// output stops consuming context.
    ElideObservations { keep_last: usize },
    /// Drop recovered format failures: an assistant turn without an action,
    /// once a later assistant turn parsed successfully, is removed from the
    /// view together with its synthesized error observation.
    DropOnRetry,
    /// Apply processors left to right.
    Chain(Vec<HistoryProcessor>),
}

impl HistoryProcessor {
    /// Build the processor chain from configuration; an empty list is the
    /// identity.
    pub fn from_config(configs: &[HistoryProcessorConfig]) -> Self {
        match configs {
            [] => HistoryProcessor::Identity,
            [one] => Self::from_one(one),
            many => HistoryProcessor::Chain(many.iter().map(Self::from_one).collect()),
        }
    }

    fn from_one(config: &HistoryProcessorConfig) -> Self {
        match config {
            HistoryProcessorConfig::Identity => HistoryProcessor::Identity,
            HistoryProcessorConfig::ElideObservations { keep_last } => {
                HistoryProcessor::ElideObservations {
                    keep_last: *keep_last,
                }
            }
            HistoryProcessorConfig::DropOnRetry => HistoryProcessor::DropOnRetry,
        }
    }

    /// Transform the turn list.  Pure: the input is cloned, never mutated.
    pub fn apply(&self, turns: &[Turn]) -> Vec<Turn> {
        match self {
            HistoryProcessor::Identity => turns.to_vec(),
            HistoryProcessor::ElideObservations { keep_last } => {
                elide_observations(turns, *keep_last)
            }
            HistoryProcessor::DropOnRetry => drop_recovered_failures(turns),
            HistoryProcessor::Chain(list) => {
                let mut current = turns.to_vec();
                for processor in list {
                    current = processor.apply(&current);
                }
                current
            }
        }
    }

    /// Apply the processor and render the result as chat messages.
    pub fn messages(&self, turns: &[Turn]) -> Vec<ChatMessage> {
        render_messages(&self.apply(turns))
    }
}

fn elide_observations(turns: &[Turn], keep_last: usize) -> Vec<Turn> {
    let observation_indices: Vec<usize> = turns
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.role == Role::ToolObservation && t.observation.is_some() && !t.is_demo
        })
        .map(|(i, _)| i)
        .collect();
    let elide_count = observation_indices.len().saturating_sub(keep_last);

    let mut out = turns.to_vec();
    for &index in &observation_indices[..elide_count] {
        let tool = preceding_action_name(turns, index).unwrap_or("a tool");
        let lines = out[index]
            .observation
            .as_ref()
            .map(|o| o.output.lines().count())
            .unwrap_or(0);
        let turn = &mut out[index];
        turn.thought = format!("Old output from {tool} omitted ({lines} lines)");
        if let Some(observation) = &mut turn.observation {
            observation.output.clear();
        }
    }
    out
}

fn preceding_action_name(turns: &[Turn], index: usize) -> Option<&str> {
    turns[..index]
        .iter()
        .rev()
        .find_map(|t| t.action.as_ref().map(|a| a.name.as_str()))
}

fn drop_recovered_failures(turns: &[Turn]) -> Vec<Turn> {
    let last_valid = turns
        .iter()
        .rposition(|t| t.role == Role::Assistant && t.action.is_some());
    let Some(last_valid) = last_valid else {
        return turns.to_vec();
    };

    let mut drop = vec![false; turns.len()];
    for (i, turn) in turns.iter().enumerate() {
        if i < last_valid
            && turn.role == Role::Assistant
            && turn.action.is_none()
            && !turn.is_demo
        {
            drop[i] = true;
            // The synthesized format-error observation that follows the
            // failure goes with it.
            if let Some(next) = turns.get(i + 1) {
                if next.role == Role::ToolObservation && next.observation.is_none() {
                    drop[i + 1] = true;
                }
            }
        }
    }
    turns
        .iter()
        .zip(drop)
        .filter(|(_, d)| !d)
        .map(|(t, _)| t.clone())
        .collect()
}

/// Render turns as the chat messages sent to the model.  Assistant turns are
/// reconstructed exactly as the model produced them (thought plus fenced
/// action block) so the conversation stays self-consistent.
fn render_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| match turn.role {
            Role::System => ChatMessage::system(&turn.thought),
            Role::User | Role::Demonstration => ChatMessage::user(&turn.thought),
            Role::ToolObservation => {
                let content = match &turn.observation {
                    Some(observation) if !turn.thought.is_empty() => {
                        format!("{}\n{}", observation.output, turn.thought)
                    }
                    Some(observation) => observation.output.clone(),
                    None => turn.thought.clone(),
                };
                ChatMessage::user(content)
            }
            Role::Assistant => match &turn.action {
                Some(action) => ChatMessage::assistant(format!(
                    "{}\n```\n{}\n```",
                    turn.thought, action.command
                )),
                None => ChatMessage::assistant(&turn.thought),
            },
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::trajectory::{Action, Observation};
    use swea_model::ChatRole;

    fn system() -> Turn {
        turn(Role::System, "you are an agent", None, None)
    }

    fn turn(role: Role, thought: &str, action: Option<&str>, output: Option<&str>) -> Turn {
        Turn {
            step_index: 0,
            role,
            thought: thought.into(),
            action: action.map(|command| Action {
                name: command.split_whitespace().next().unwrap_or("").into(),
                args: HashMap::new(),
                command: command.into(),
                is_terminal: false,
            }),
            observation: output.map(|o| Observation {
                output: o.into(),
                exit_code: 0,
                duration_ms: 1,
                state: None,
            }),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            is_demo: false,
        }
    }

    fn sample_history() -> Vec<Turn> {
        vec![
            system(),
            turn(Role::User, "fix the bug", None, None),
            turn(Role::Assistant, "look", Some("ls"), None),
            turn(Role::ToolObservation, "", None, Some("file_a\nfile_b")),
            turn(Role::Assistant, "open it", Some("open file_a"), None),
            turn(Role::ToolObservation, "", None, Some("contents of a")),
            turn(Role::Assistant, "check", Some("cat file_b"), None),
            turn(Role::ToolObservation, "", None, Some("contents of b")),
        ]
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    #[test]
    fn identity_keeps_everything_verbatim() {
        let turns = sample_history();
        let messages = HistoryProcessor::Identity.messages(&turns);
        assert_eq!(messages.len(), turns.len());
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[2].content.contains("```\nls\n```"));
        assert_eq!(messages[3].content, "file_a\nfile_b");
    }

    #[test]
    fn processors_do_not_mutate_input() {
        let turns = sample_history();
        let before = serde_json::to_string(&turns).unwrap();
        let _ = HistoryProcessor::ElideObservations { keep_last: 1 }.apply(&turns);
        let _ = HistoryProcessor::DropOnRetry.apply(&turns);
        assert_eq!(serde_json::to_string(&turns).unwrap(), before);
    }

    // ── ElideObservations ─────────────────────────────────────────────────────

    #[test]
    fn elide_keeps_last_k_observations_full() {
        let turns = sample_history();
        let out = HistoryProcessor::ElideObservations { keep_last: 1 }.apply(&turns);
        // First two observations are placeholders, the last is intact.
        assert!(out[3].thought.contains("Old output from ls omitted"));
        assert!(out[3].observation.as_ref().unwrap().output.is_empty());
        assert!(out[5].thought.contains("Old output from open omitted"));
        assert_eq!(out[7].observation.as_ref().unwrap().output, "contents of b");
    }

    #[test]
    fn elide_preserves_assistant_turns() {
        let turns = sample_history();
        let out = HistoryProcessor::ElideObservations { keep_last: 0 }.apply(&turns);
        let assistants: Vec<&Turn> =
            out.iter().filter(|t| t.role == Role::Assistant).collect();
        assert_eq!(assistants.len(), 3);
        assert_eq!(assistants[0].thought, "look");
    }

    #[test]
    fn elide_with_large_k_is_identity() {
        let turns = sample_history();
        let out = HistoryProcessor::ElideObservations { keep_last: 10 }.apply(&turns);
        assert_eq!(out[3].observation.as_ref().unwrap().output, "file_a\nfile_b");
    }

    // ── DropOnRetry ───────────────────────────────────────────────────────────

    fn history_with_recovered_failure() -> Vec<Turn> {
        vec![
            system(),
            turn(Role::User, "fix the bug", None, None),
            turn(Role::Assistant, "garbled nonsense", None, None),
            turn(Role::ToolObservation, "format error: no action found", None, None),
            turn(Role::Assistant, "retry", Some("ls"), None),
            turn(Role::ToolObservation, "", None, Some("file_a")),
        ]
    }

    #[test]
    fn drop_on_retry_removes_recovered_failures() {
        let turns = history_with_recovered_failure();
        let out = HistoryProcessor::DropOnRetry.apply(&turns);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|t| t.thought != "garbled nonsense"));
        assert!(out
            .iter()
            .all(|t| !t.thought.contains("format error")));
    }

    #[test]
    fn drop_on_retry_keeps_unrecovered_failure() {
        // The failure is the most recent assistant turn — the model still
        // needs to see the error message to retry.
        let turns = vec![
            system(),
            turn(Role::Assistant, "garbled", None, None),
            turn(Role::ToolObservation, "format error", None, None),
        ];
        let out = HistoryProcessor::DropOnRetry.apply(&turns);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn drop_on_retry_does_not_touch_persisted_view() {
        let turns = history_with_recovered_failure();
        let _ = HistoryProcessor::DropOnRetry.apply(&turns);
        assert_eq!(turns.len(), 6, "persisted trajectory keeps the failure");
    }

    // ── Chain ─────────────────────────────────────────────────────────────────

    #[test]
    fn chain_applies_in_order() {
        let mut turns = history_with_recovered_failure();
        turns.push(turn(Role::Assistant, "more", Some("cat file_a"), None));
        turns.push(turn(Role::ToolObservation, "", None, Some("body")));
        let chain = HistoryProcessor::Chain(vec![
            HistoryProcessor::DropOnRetry,
            HistoryProcessor::ElideObservations { keep_last: 1 },
        ]);
        let out = chain.apply(&turns);
        assert!(out.iter().all(|t| t.thought != "garbled nonsense"));
        let observations: Vec<&Turn> = out
            .iter()
            .filter(|t| t.role == Role::ToolObservation && t.observation.is_some())
            .collect();
        assert!(observations[0].thought.contains("omitted"));
        assert_eq!(observations[1].observation.as_ref().unwrap().output, "body");
    }

    #[test]
    fn from_config_builds_expected_shapes() {
        assert_eq!(
            HistoryProcessor::from_config(&[]),
            HistoryProcessor::Identity
        );
        assert_eq!(
            HistoryProcessor::from_config(&[HistoryProcessorConfig::DropOnRetry]),
            HistoryProcessor::DropOnRetry
        );
        let chain = HistoryProcessor::from_config(&[
            HistoryProcessorConfig::ElideObservations { keep_last: 3 },
            HistoryProcessorConfig::DropOnRetry,
        ]);
        assert!(matches!(chain, HistoryProcessor::Chain(ref v) if v.len() == 2));
    }
}
