// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Top-level configuration tree.
///
/// Assembled by deep-merging every `--config` file in argument order, then
/// applying dotted-path CLI overrides (`--agent.model.name=...`) on top.
/// Unknown keys anywhere in the tree are rejected at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub instances: InstancesConfig,
    #[serde(default)]
    pub problem_statement: ProblemStatementConfig,
    /// Number of parallel workers for batch runs.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Root directory for run output (trajectories, patches, logs).
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

fn default_num_workers() -> usize {
    1
}
fn default_output_root() -> PathBuf {
    PathBuf::from("trajectories")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            env: EnvConfig::default(),
            tools: ToolsConfig::default(),
            actions: ActionsConfig::default(),
            instances: InstancesConfig::default(),
            problem_statement: ProblemStatementConfig::default(),
            num_workers: default_num_workers(),
            output_root: default_output_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: ModelConfig,
    /// Consecutive malformed-reply retries tolerated before the instance is
    /// closed with a format failure.
    #[serde(default = "default_format_retries")]
    pub format_retries: u32,
    /// Message shown to the model after a malformed reply.  `{{error}}` is
    /// replaced with the parser's diagnostic.
    #[serde(default = "default_format_error_template")]
    pub format_error_template: String,
    /// Trajectory files whose turns are prepended as demonstrations.
    #[serde(default)]
    pub demonstrations: Vec<PathBuf>,
    /// History processors applied (in order) before every model query.
    #[serde(default)]
    pub history: Vec<HistoryProcessorConfig>,
    /// Command prefixes the parser refuses to dispatch.
    #[serde(default = "default_blocked_actions")]
    pub blocked_actions: Vec<String>,
}

fn default_format_retries() -> u32 {
    2
}
fn default_format_error_template() -> String {
    "Your output could not be parsed: {{error}}\n\
     Please reply with a thought followed by exactly one command in a \
     triple-backtick block."
        .into()
}
fn default_blocked_actions() -> Vec<String> {
    ["vim", "vi", "emacs", "nano", "su", "nohup", "git config --get-all"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            format_retries: default_format_retries(),
            format_error_template: default_format_error_template(),
            demonstrations: Vec::new(),
            history: Vec::new(),
            blocked_actions: default_blocked_actions(),
        }
    }
}

/// One entry in the history-processing chain.
///
/// The set is closed: every supported transformation is a variant here, and
/// a chain is just the `Vec` order in which they run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum HistoryProcessorConfig {
    /// Send the history verbatim.
    Identity,
    /// Keep the last `keep_last` observations in full; replace older ones
    /// with a one-line placeholder naming the tool.
    ElideObservations { keep_last: usize },
    /// Drop recovered format-failure turns from the view sent to the model.
    DropOnRetry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Model identifier forwarded to the provider API.
    pub name: String,
    /// Base URL of an OpenAI-compatible endpoint.  Deterministic test
    /// providers (`scripted`, `replay`) ignore it.
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Hard cost ceiling for a single instance (USD).  0 disables the gate.
    #[serde(default = "default_per_instance_cost_limit")]
    pub per_instance_cost_limit: f64,
    /// Hard cost ceiling across a whole batch run (USD).  0 disables.
    #[serde(default)]
    pub total_cost_limit: f64,
    /// Retry budget for transient provider failures (429/5xx/network).
    #[serde(default = "default_model_max_retries")]
    pub max_retries: u32,
    /// Cost charged per 1k input / output tokens; used when the provider
    /// does not report cost itself.
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
    /// Trajectory file replayed verbatim when `name` is `replay`.
    pub replay_path: Option<PathBuf>,
}

fn default_per_instance_cost_limit() -> f64 {
    3.0
}
fn default_model_max_retries() -> u32 {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4o".into(),
            base_url: None,
            api_key_env: None,
            temperature: Some(0.0),
            max_output_tokens: Some(2048),
            per_instance_cost_limit: default_per_instance_cost_limit(),
            total_cost_limit: 0.0,
            max_retries: default_model_max_retries(),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            replay_path: None,
        }
    }
}

/// Where the sandboxed shell lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    /// A Docker container started per instance.
    #[default]
    Docker,
    /// A plain bash process in a scratch directory.  Used by tests and for
    /// tasks that are safe to run on the host.
    Local,
}

impl std::fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentKind::Docker => write!(f, "docker"),
            DeploymentKind::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvConfig {
    #[serde(default)]
    pub deployment: DeploymentKind,
    /// Base container image providing the execution environment.
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub repo: RepoConfig,
    /// Script run after checkout, before the agent takes control.
    #[serde(default)]
    pub setup: Option<String>,
    /// Seconds allowed for the shell session to come up.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Whole-command timeout for ordinary actions.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Timeout for installs, test suites, and the setup script.
    #[serde(default = "default_long_timeout")]
    pub long_action_timeout_secs: u64,
    /// Fires when a running command produces no output for this long.
    #[serde(default = "default_no_output_timeout")]
    pub no_output_timeout_secs: u64,
    /// Grace period between interrupt and kill when a command is cancelled.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Captured output beyond this many bytes is truncated.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    /// Reuse prepared environments keyed by (image, repo, setup).
    #[serde(default = "default_true")]
    pub cache_prepared: bool,
}

fn default_image() -> String {
    "python:3.11".into()
}
fn default_startup_timeout() -> u64 {
    60
}
fn default_action_timeout() -> u64 {
    25
}
fn default_long_timeout() -> u64 {
    500
}
fn default_no_output_timeout() -> u64 {
    120
}
fn default_kill_grace() -> u64 {
    5
}
fn default_output_cap() -> usize {
    1024 * 1024
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentKind::Docker,
            image: default_image(),
            repo: RepoConfig::default(),
            setup: None,
            startup_timeout_secs: default_startup_timeout(),
            action_timeout_secs: default_action_timeout(),
            long_action_timeout_secs: default_long_timeout(),
            no_output_timeout_secs: default_no_output_timeout(),
            kill_grace_secs: default_kill_grace(),
            output_cap_bytes: default_output_cap(),
            cache_prepared: true,
        }
    }
}

/// Repository source for a single `run` invocation.  At most one of the
/// three location fields may be set; batch instances carry their own source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// Remote URL cloned into the sandbox.
    pub github_url: Option<String>,
    /// Commit checked out after cloning.
    pub base_commit: Option<String>,
    /// Local path copied into the sandbox.
    pub path: Option<PathBuf>,
    /// Path inside the base image that already contains the repository.
    pub image_path: Option<PathBuf>,
}

impl RepoConfig {
    pub fn is_empty(&self) -> bool {
        self.github_url.is_none() && self.path.is_none() && self.image_path.is_none()
    }

    /// Number of location fields set; valid configs have 0 or 1.
    pub fn source_count(&self) -> usize {
        [
            self.github_url.is_some(),
            self.path.is_some(),
            self.image_path.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProblemStatementConfig {
    /// Inline problem text.
    pub text: Option<String>,
    /// Path to a file holding the problem text.
    pub path: Option<PathBuf>,
    /// Issue URL fetched at startup.
    pub github_url: Option<String>,
}

impl ProblemStatementConfig {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.path.is_none() && self.github_url.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Tool bundle directories, loaded in order.
    #[serde(default)]
    pub bundles: Vec<PathBuf>,
    /// Path inside the sandbox where bundles are installed.
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
    /// Environment variables seeded into the persisted env store.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Dispatch action lines that do not name a declared tool straight to the
    /// shell.  When false, such actions fail with an unknown-tool parse error.
    #[serde(default = "default_true")]
    pub shell_passthrough: bool,
}

fn default_install_root() -> PathBuf {
    PathBuf::from("/root/tools")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bundles: Vec::new(),
            install_root: default_install_root(),
            env: HashMap::new(),
            shell_passthrough: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionsConfig {
    /// Apply the final patch to the local checkout after a submitted run.
    #[serde(default)]
    pub apply_patch_locally: bool,
    /// Accepted for interface compatibility; PR creation is delegated to
    /// external tooling and only logged here.
    #[serde(default)]
    pub open_pr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSourceKind {
    /// SWE-bench-style JSON array with repo/commit/problem fields.
    #[default]
    SweBench,
    /// Generic JSON or JSONL file of instance records.
    File,
    /// The HuggingFace datasets server.
    Huggingface,
    /// Expert-annotated file format (instances wrapped with metadata).
    ExpertFile,
}

impl std::fmt::Display for InstanceSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceSourceKind::SweBench => write!(f, "swe_bench"),
            InstanceSourceKind::File => write!(f, "file"),
            InstanceSourceKind::Huggingface => write!(f, "huggingface"),
            InstanceSourceKind::ExpertFile => write!(f, "expert_file"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstancesConfig {
    #[serde(rename = "type", default)]
    pub kind: InstanceSourceKind,
    /// File path for file-backed sources; dataset name for huggingface.
    pub path: Option<String>,
    pub subset: Option<String>,
    pub split: Option<String>,
    /// Python-style slice `start:end` applied after loading.
    pub slice: Option<String>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: u64,
}

fn default_shuffle_seed() -> u64 {
    42
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            kind: InstanceSourceKind::SweBench,
            path: None,
            subset: None,
            split: None,
            slice: None,
            shuffle: false,
            shuffle_seed: default_shuffle_seed(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
