// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// Shared flags for commands that drive the agent.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonRunArgs {
    /// Config file; repeatable, later files override earlier ones.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Dotted-path config override, e.g. --set env.image=python:3.12.
    /// Applied after all config files; repeatable.
    #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Model identifier (reserved names: instant_submit, replay).
    #[arg(long = "agent.model.name", value_name = "NAME")]
    pub model_name: Option<String>,

    /// Per-instance cost ceiling in USD (0 disables the gate).
    #[arg(long = "agent.model.per_instance_cost_limit", value_name = "USD")]
    pub per_instance_cost_limit: Option<f64>,

    /// Run output directory name under the output root.
    /// Defaults to a timestamped id.
    #[arg(long = "run_id", value_name = "NAME")]
    pub run_id: Option<String>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl CommonRunArgs {
    /// Flatten the explicit flags into dotted-path overrides, with the
    /// freeform --set entries last so they win.
    pub fn overrides(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        if let Some(name) = &self.model_name {
            out.push(("agent.model.name".to_string(), name.clone()));
        }
        if let Some(limit) = self.per_instance_cost_limit {
            out.push((
                "agent.model.per_instance_cost_limit".to_string(),
                limit.to_string(),
            ));
        }
        for entry in &self.set {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("--set expects KEY=VALUE, got {entry:?}"))?;
            out.push((key.to_string(), value.to_string()));
        }
        Ok(out)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "sweagent",
    about = "Drive a language model to solve software-engineering tasks in sandboxed environments",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Solve a single instance.
    Run {
        #[command(flatten)]
        common: CommonRunArgs,

        /// Stable id for the instance; defaults to `command-line-instance`.
        #[arg(long = "instance_id", default_value = "command-line-instance")]
        instance_id: String,

        /// Inline problem text.
        #[arg(long = "problem_statement.text", value_name = "TEXT")]
        problem_text: Option<String>,

        /// File holding the problem text.
        #[arg(long = "problem_statement.path", value_name = "PATH")]
        problem_path: Option<PathBuf>,

        /// GitHub issue URL fetched at startup.
        #[arg(long = "problem_statement.github_url", value_name = "URL")]
        problem_github_url: Option<String>,

        /// Remote repository cloned into the sandbox.
        #[arg(long = "env.repo.github_url", value_name = "URL")]
        repo_github_url: Option<String>,

        /// Local repository copied into the sandbox.
        #[arg(long = "env.repo.path", value_name = "PATH")]
        repo_path: Option<PathBuf>,

        /// Path inside the base image that already holds the repository.
        #[arg(long = "env.repo.image_name", value_name = "PATH")]
        repo_image_path: Option<PathBuf>,

        /// Apply the final patch to the local checkout after a submit.
        #[arg(long = "actions.apply_patch_locally")]
        apply_patch_locally: bool,

        /// Accepted for interface compatibility; PR creation is delegated to
        /// external tooling.
        #[arg(long = "actions.open_pr")]
        open_pr: bool,
    },

    /// Solve a dataset of instances with bounded parallelism.
    RunBatch {
        #[command(flatten)]
        common: CommonRunArgs,

        /// Instance source kind (swe_bench | file | huggingface | expert_file).
        #[arg(long = "instances.type", value_name = "KIND")]
        instances_type: Option<String>,

        /// Instance file path, or dataset name for huggingface.
        #[arg(long = "instances.path", value_name = "PATH")]
        instances_path: Option<String>,

        #[arg(long = "instances.subset", value_name = "NAME")]
        instances_subset: Option<String>,

        #[arg(long = "instances.split", value_name = "NAME")]
        instances_split: Option<String>,

        /// Python-style slice start:end applied after loading.
        #[arg(long = "instances.slice", value_name = "SLICE")]
        instances_slice: Option<String>,

        /// Shuffle instances with a fixed seed before running.
        #[arg(long = "instances.shuffle")]
        instances_shuffle: bool,

        /// Worker pool size.
        #[arg(long = "num_workers", value_name = "N")]
        num_workers: Option<usize>,

        /// Re-run instances that already have a terminal trajectory.
        #[arg(long)]
        redo: bool,

        /// Print the instance start order and exit without running.
        #[arg(long)]
        preview: bool,
    },

    /// Re-run a recorded trajectory's actions against a fresh environment.
    RunReplay {
        #[command(flatten)]
        common: CommonRunArgs,

        /// The trajectory file to replay.
        #[arg(long = "traj_path", value_name = "PATH")]
        traj_path: PathBuf,

        #[arg(long = "env.repo.path", value_name = "PATH")]
        repo_path: Option<PathBuf>,
    },

    /// Convert a recorded trajectory into a demonstration file.
    TrajToDemo {
        /// The trajectory file to convert.
        traj_path: PathBuf,

        /// Output path; defaults to the input with a .demo.traj.json suffix.
        #[arg(long, short = 'o', value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Browse trajectory files from finished runs.
    Inspector {
        /// Run directory holding *.traj.json files.
        #[arg(long, default_value = "trajectories")]
        dir: PathBuf,

        /// Show the full turn list of one instance instead of the run table.
        #[arg(long, value_name = "ID")]
        instance: Option<String>,
    },

    /// Print the effective merged configuration and exit.
    ShowConfig {
        #[arg(long = "config", value_name = "PATH")]
        config: Vec<PathBuf>,
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "sweagent", &mut std::io::stdout());
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_dotted_flags() {
        let cli = Cli::try_parse_from([
            "sweagent",
            "run",
            "--agent.model.name",
            "instant_submit",
            "--env.repo.path",
            "/tmp/repo",
            "--problem_statement.text",
            "fix it",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                common,
                repo_path,
                problem_text,
                ..
            } => {
                assert_eq!(common.model_name.as_deref(), Some("instant_submit"));
                assert_eq!(repo_path, Some(PathBuf::from("/tmp/repo")));
                assert_eq!(problem_text.as_deref(), Some("fix it"));
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_run_batch_flags() {
        let cli = Cli::try_parse_from([
            "sweagent",
            "run-batch",
            "--instances.type",
            "file",
            "--instances.path",
            "instances.json",
            "--instances.slice",
            "0:5",
            "--num_workers",
            "4",
            "--redo",
        ])
        .unwrap();
        match cli.command {
            Commands::RunBatch {
                instances_type,
                instances_slice,
                num_workers,
                redo,
                ..
            } => {
                assert_eq!(instances_type.as_deref(), Some("file"));
                assert_eq!(instances_slice.as_deref(), Some("0:5"));
                assert_eq!(num_workers, Some(4));
                assert!(redo);
            }
            other => panic!("wrong command: {other:?}"),
        }
    }

    #[test]
    fn overrides_flatten_explicit_flags_before_set() {
        let common = CommonRunArgs {
            config: vec![],
            set: vec!["agent.model.name=gpt-4o".into()],
            model_name: Some("instant_submit".into()),
            per_instance_cost_limit: Some(2.5),
            run_id: None,
            verbose: 0,
        };
        let overrides = common.overrides().unwrap();
        assert_eq!(overrides[0].0, "agent.model.name");
        assert_eq!(overrides.last().unwrap().1, "gpt-4o", "--set wins");
    }

    #[test]
    fn malformed_set_entry_is_rejected() {
        let common = CommonRunArgs {
            config: vec![],
            set: vec!["no-equals-sign".into()],
            model_name: None,
            per_instance_cost_limit: None,
            run_id: None,
            verbose: 0,
        };
        assert!(common.overrides().is_err());
    }
}
