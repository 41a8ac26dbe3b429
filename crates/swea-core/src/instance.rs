// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use swea_env::RepoSource;

/// Tests that characterise a correct fix: `fail_to_pass` fail before the
/// change and pass after; `pass_to_pass` must keep passing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationHooks {
    #[serde(default)]
    pub fail_to_pass: Vec<String>,
    #[serde(default)]
    pub pass_to_pass: Vec<String>,
}

/// An immutable task descriptor: one problem for the agent to solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Stable identifier; doubles as the trajectory file key, so it must be
    /// filesystem-safe (see [`Instance::sanitized_id`]).
    pub id: String,
    pub problem_statement: String,
    /// Supplementary files whose contents are appended to the statement.
    #[serde(default)]
    pub extra_files: Vec<PathBuf>,
    pub repo: RepoSource,
    /// Base container image providing the execution environment.
    pub image: String,
    /// Script run after checkout, before the agent takes control.
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationHooks>,
}

impl Instance {
    /// The id with path-hostile characters replaced, usable as a file stem.
    pub fn sanitized_id(&self) -> String {
        self.id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// The full problem text: statement plus any supplementary files.
    pub fn full_problem_statement(&self) -> String {
        let mut text = self.problem_statement.clone();
        for path in &self.extra_files {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    text.push_str(&format!("\n\n--- {} ---\n{contents}", path.display()));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read extra file");
                }
            }
        }
        text
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
