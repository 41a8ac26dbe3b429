// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use swea_config::Config;
use swea_env::{EnvController, RepoSource};
use swea_model::{CostTracker, Model, ModelError};
use swea_tools::{ActionParser, ParsedAction, ToolCatalogue};

use crate::history::HistoryProcessor;
use crate::instance::Instance;
use crate::prompts;
use crate::trajectory::{
    Action, Observation, Role, Status, Trajectory, TrajectoryWriter, Turn,
};

/// The turn-by-turn state machine driving one instance.
///
/// Owns its trajectory exclusively while running; every collaborator is
/// constructor-injected so batch isolation is checkable.  The loop is
/// synchronous from its own viewpoint: one model query, one parse, one
/// dispatch per turn.
pub struct AgentLoop {
    model: Arc<dyn Model>,
    parser: ActionParser,
    env: EnvController,
    config: Arc<Config>,
    cost: CostTracker,
    processor: HistoryProcessor,
    trajectory: Trajectory,
    writer: TrajectoryWriter,
    cancel: watch::Receiver<bool>,
    format_failures: u32,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn Model>,
        catalogue: Arc<ToolCatalogue>,
        env: EnvController,
        config: Arc<Config>,
        cost: CostTracker,
        writer: TrajectoryWriter,
        instance_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let parser = ActionParser::new(
            catalogue,
            config.agent.blocked_actions.clone(),
            config.tools.shell_passthrough,
        );
        let processor = HistoryProcessor::from_config(&config.agent.history);
        Self {
            model,
            parser,
            env,
            config,
            cost,
            processor,
            trajectory: Trajectory::new(instance_id),
            writer,
            cancel,
            format_failures: 0,
        }
    }

    /// Drive the instance to a terminal status and return the sealed
    /// trajectory.  The environment is closed on every path out.
    pub async fn run(mut self, instance: &Instance) -> anyhow::Result<Trajectory> {
        self.setup(instance)?;

        let (status, patch) = match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(instance = %instance.id, error = %e, "instance failed");
                (Status::ExitEnvironment, String::new())
            }
        };

        info!(instance = %instance.id, %status, cost = self.cost.instance_cost(), "instance finished");
        self.trajectory.env_info = self.env.env_info();
        self.trajectory.set_terminal(status, patch);
        self.writer.write(&self.trajectory)?;
        self.env.close().await;
        Ok(self.trajectory)
    }

    // ── SETUP ─────────────────────────────────────────────────────────────────

    fn setup(&mut self, instance: &Instance) -> anyhow::Result<()> {
        self.trajectory.env_info = self.env.env_info();

        let docs = self.parser.catalogue().docs();
        let env_defaults = self.parser.catalogue().env_defaults();
        self.push_text_turn(Role::System, prompts::system_prompt(&docs, &env_defaults));

        for path in &self.config.agent.demonstrations {
            match TrajectoryWriter::load(path) {
                Ok(demo) => {
                    let mut turn = self.text_turn(Role::Demonstration, prompts::demonstration_text(&demo));
                    turn.is_demo = true;
                    self.trajectory.push(turn);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable demonstration"),
            }
        }

        let repo_note = match &instance.repo {
            RepoSource::None => None,
            _ => Some(format!(
                "The repository is checked out in {}.",
                self.env.repo_dir()
            )),
        };
        self.push_text_turn(
            Role::User,
            prompts::instance_prompt(&instance.full_problem_statement(), repo_note.as_deref()),
        );
        self.writer.write(&self.trajectory)?;
        Ok(())
    }

    // ── THINKING → EXECUTING → OBSERVING ─────────────────────────────────────

    async fn drive(&mut self) -> anyhow::Result<(Status, String)> {
        loop {
            if *self.cancel.borrow() {
                return Ok((Status::Aborted, String::new()));
            }

            // THINKING: compact the history, query the model.
            let messages = self.processor.messages(&self.trajectory.history);
            let model = Arc::clone(&self.model);
            let mut cancel = self.cancel.clone();
            let completion = tokio::select! {
                biased;
                _ = cancel.changed() => {
                    return Ok((Status::Aborted, String::new()));
                }
                result = model.query(&messages) => result,
            };
            let completion = match completion {
                Ok(completion) => completion,
                Err(ModelError::ContextWindow) => {
                    return Ok((Status::ExitContext, String::new()))
                }
                Err(e) => {
                    warn!(error = %e, "model query failed");
                    return Ok((Status::ExitEnvironment, String::new()));
                }
            };
            let cost_exceeded = self.cost.charge(&completion.usage).is_err();

            // Parse the reply into exactly one action.
            match self.parser.parse(&completion.text) {
                Err(parse_error) => {
                    debug!(%parse_error, "malformed reply");
                    self.push_assistant_turn(&completion, completion.text.clone(), None);
                    if cost_exceeded {
                        return Ok((Status::ExitCost, String::new()));
                    }
                    let message = prompts::format_error_message(
                        &self.config.agent.format_error_template,
                        &parse_error.to_string(),
                    );
                    self.push_text_turn(Role::ToolObservation, message);
                    self.writer.write(&self.trajectory)?;

                    self.format_failures += 1;
                    if self.format_failures >= self.config.agent.format_retries {
                        return Ok((Status::ExitFormat, String::new()));
                    }
                    continue;
                }
                Ok(action) => {
                    self.format_failures = 0;
                    self.push_assistant_turn(
                        &completion,
                        action.thought.clone(),
                        Some(&action),
                    );
                    if cost_exceeded {
                        // The reply is recorded but its action never runs.
                        return Ok((Status::ExitCost, String::new()));
                    }

                    match self.execute_and_observe(&action).await? {
                        LoopStep::Continue => {
                            self.writer.write(&self.trajectory)?;
                        }
                        LoopStep::Terminal(status, patch) => {
                            return Ok((status, patch));
                        }
                    }
                }
            }
        }
    }

    /// EXECUTING + OBSERVING for one parsed action.
    async fn execute_and_observe(
        &mut self,
        action: &ParsedAction,
    ) -> anyhow::Result<LoopStep> {
        let (result, interrupted) = {
            let handle = self.env.interrupt_handle();
            let mut cancel = self.cancel.clone();
            let mut interrupted = false;
            let exec = self.env.exec_action(&action.command, action.timeout_class);
            tokio::pin!(exec);
            let result = loop {
                tokio::select! {
                    result = &mut exec => break result,
                    changed = cancel.changed(), if !interrupted => {
                        let _ = changed;
                        interrupted = true;
                        handle.interrupt();
                    }
                }
            };
            (result, interrupted)
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "environment lost during exec");
                return Ok(LoopStep::Terminal(Status::ExitEnvironment, String::new()));
            }
        };
        if interrupted {
            self.push_observation(action, &result, None);
            return Ok(LoopStep::Terminal(Status::Aborted, String::new()));
        }

        let state = match self.env.state().await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "environment lost during state inspection");
                return Ok(LoopStep::Terminal(Status::ExitEnvironment, String::new()));
            }
        };
        self.push_observation(action, &result, state);

        if action.is_terminal {
            let patch = match self.env.diff().await {
                Ok(patch) => patch,
                Err(e) => {
                    warn!(error = %e, "environment lost during final diff");
                    return Ok(LoopStep::Terminal(Status::ExitEnvironment, String::new()));
                }
            };
            let status = if action.name == "submit" {
                Status::Submitted
            } else {
                Status::ExitUser
            };
            return Ok(LoopStep::Terminal(status, patch));
        }
        Ok(LoopStep::Continue)
    }

    // ── Turn construction ─────────────────────────────────────────────────────

    fn text_turn(&self, role: Role, text: String) -> Turn {
        Turn {
            step_index: 0,
            role,
            thought: text,
            action: None,
            observation: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: self.cost.instance_cost(),
            is_demo: false,
        }
    }

    fn push_text_turn(&mut self, role: Role, text: String) {
        let turn = self.text_turn(role, text);
        self.trajectory.push(turn);
    }

    fn push_assistant_turn(
        &mut self,
        completion: &swea_model::Completion,
        thought: String,
        action: Option<&ParsedAction>,
    ) {
        let turn = Turn {
            step_index: 0,
            role: Role::Assistant,
            thought,
            action: action.map(|a| Action {
                name: a.name.clone(),
                args: a.args.clone(),
                command: a.command.clone(),
                is_terminal: a.is_terminal,
            }),
            observation: None,
            tokens_in: completion.usage.input_tokens,
            tokens_out: completion.usage.output_tokens,
            cost: self.cost.instance_cost(),
            is_demo: false,
        };
        self.trajectory.push(turn);
    }

    /// Shape and append the observation for one executed action.
    fn push_observation(
        &mut self,
        action: &ParsedAction,
        result: &swea_env::ExecResult,
        state: Option<swea_env::SessionState>,
    ) {
        let mut output = result.stdout.clone();
        if result.timed_out {
            output.push_str(&prompts::timeout_notice(
                self.env.timeout_secs(action.timeout_class),
            ));
        } else if output.trim().is_empty() {
            output = prompts::EMPTY_OUTPUT_MARKER.to_string();
        }

        let footer = state.as_ref().map(prompts::state_footer).unwrap_or_default();
        let turn = Turn {
            step_index: 0,
            role: Role::ToolObservation,
            thought: footer,
            action: None,
            observation: Some(Observation {
                output,
                exit_code: result.exit_code,
                duration_ms: result.duration.as_millis() as u64,
                state,
            }),
            tokens_in: 0,
            tokens_out: 0,
            cost: self.cost.instance_cost(),
            is_demo: false,
        };
        self.trajectory.push(turn);
    }
}

enum LoopStep {
    Continue,
    Terminal(Status, String),
}
