// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly: the system prompt (interface description + compiled tool
//! docs), the instance prompt, demonstration framing, and the small shaped
//! messages used in observations.

use std::collections::HashMap;

use crate::trajectory::{Role, Trajectory};

/// Observation recorded when a command succeeds silently.  An explicit
/// marker, never an empty message: the model must be able to distinguish
/// "ran fine, said nothing" from "produced no observation".
pub const EMPTY_OUTPUT_MARKER: &str =
    "Your command ran successfully and did not produce any output.";

/// Build the system prompt shown once at the start of every conversation.
pub fn system_prompt(tool_docs: &str, env_defaults: &HashMap<String, String>) -> String {
    let mut env_lines: Vec<String> = env_defaults
        .iter()
        .map(|(k, v)| format!("  {k}={v}"))
        .collect();
    env_lines.sort();
    let env_block = if env_lines.is_empty() {
        String::new()
    } else {
        format!(
            "\nThe following environment variables are set in your session:\n{}\n",
            env_lines.join("\n")
        )
    };

    format!(
        "SETTING: You are an autonomous programmer working in a sandboxed shell \
         session. Your task is to solve a software-engineering problem inside the \
         repository checked out in your working directory.\n\
         \n\
         In addition to standard shell commands, the following special commands \
         are available:\n\
         \n\
         {tool_docs}\
         {env_block}\
         \n\
         RESPONSE FORMAT: Reply with your reasoning, followed by exactly one \
         command in a triple-backtick block, for example:\n\
         \n\
         I want to see the failing test first.\n\
         ```\n\
         open tests/test_parser.py 42\n\
         ```\n\
         \n\
         Rules:\n\
         - Issue exactly one command per reply; wait for its output before the next.\n\
         - Interactive programs (vim, python REPL, anything that prompts) are not \
           supported.\n\
         - When you are satisfied with your changes, run `submit` to finish."
    )
}

/// Build the first user turn from the instance.
pub fn instance_prompt(problem_statement: &str, repo_note: Option<&str>) -> String {
    let repo_line = match repo_note {
        Some(note) => format!("\n\n{note}"),
        None => String::new(),
    };
    format!(
        "We're currently solving the following issue within our repository. \
         Here is the issue text:\n\
         --- BEGIN ISSUE ---\n\
         {problem_statement}\n\
         --- END ISSUE ---{repo_line}\n\n\
         Now, let's resolve the issue. Remember: exactly one command per reply, \
         and `submit` when done."
    )
}

/// Render the format-error template with the parser diagnostic.
pub fn format_error_message(template: &str, error: &str) -> String {
    template.replace("{{error}}", error)
}

/// Notice appended to an observation when the command was cut short.
pub fn timeout_notice(seconds: u64) -> String {
    format!(
        "\nEXECUTION TIMED OUT AFTER {seconds} SECONDS. The command was \
         interrupted; partial output is shown above. Long-running commands \
         should be narrowed down or run on a smaller input."
    )
}

/// Footer attached to observations from the editor state inspection.
pub fn state_footer(state: &swea_env::SessionState) -> String {
    let open = state.open_file.as_deref().unwrap_or("n/a");
    format!(
        "\n(Open file: {open})\n(Current directory: {cwd})",
        cwd = state.cwd
    )
}

/// Flatten a recorded trajectory into demonstration text prepended to the
/// conversation.  Only the acting turns are shown; system prompts and demo
/// metadata stay out.
pub fn demonstration_text(trajectory: &Trajectory) -> String {
    let mut out = String::from(
        "Here is a demonstration of how to correctly accomplish a similar task.\n\
         It is included to show you how to correctly use the interface.\n\
         --- DEMONSTRATION ---\n",
    );
    for turn in &trajectory.history {
        match turn.role {
            Role::Assistant => {
                if let Some(action) = &turn.action {
                    out.push_str(&format!(
                        "{}\n```\n{}\n```\n",
                        turn.thought, action.command
                    ));
                }
            }
            Role::ToolObservation => {
                if let Some(observation) = &turn.observation {
                    out.push_str(&format!("{}\n", observation.output));
                }
            }
            _ => {}
        }
    }
    out.push_str("--- END OF DEMONSTRATION ---\n");
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
