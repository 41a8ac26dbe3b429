// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use swea_env::{EnvInfo, SessionState};

/// Where a trajectory ended up.  `InProgress` is the only non-terminal
/// state; after a terminal status is set the trajectory is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    InProgress,
    Submitted,
    ExitCost,
    ExitFormat,
    ExitContext,
    ExitEnvironment,
    ExitUser,
    Aborted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::InProgress)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::InProgress => "in_progress",
            Status::Submitted => "submitted",
            Status::ExitCost => "exit_cost",
            Status::ExitFormat => "exit_format",
            Status::ExitContext => "exit_context",
            Status::ExitEnvironment => "exit_environment",
            Status::ExitUser => "exit_user",
            Status::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolObservation,
    Demonstration,
}

/// A parsed tool call as recorded in the trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    /// The exact command line dispatched to the shell.
    pub command: String,
    #[serde(default)]
    pub is_terminal: bool,
}

/// What came back from dispatching an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
}

/// One record in a trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub step_index: usize,
    pub role: Role,
    /// Free-form text: LM reasoning for assistant turns, prompt text for
    /// system/user turns, shaped output for observations.
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    /// Per-turn token counters (zero for non-assistant turns).
    #[serde(default)]
    pub tokens_in: u32,
    #[serde(default)]
    pub tokens_out: u32,
    /// Cumulative instance cost at this turn.  Non-decreasing.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub is_demo: bool,
}

/// Full ordered record of one instance run.  Append-only until a terminal
/// status is set; immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub instance_id: String,
    pub status: Status,
    pub final_patch: String,
    pub total_cost: f64,
    #[serde(default)]
    pub env_info: EnvInfo,
    pub history: Vec<Turn>,
}

impl Trajectory {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: Status::InProgress,
            final_patch: String::new(),
            total_cost: 0.0,
            env_info: EnvInfo::default(),
            history: Vec::new(),
        }
    }

    pub fn next_step_index(&self) -> usize {
        self.history.len()
    }

    /// Append a turn.  Panics if called after a terminal status was set —
    /// that is a bug in the caller, not a recoverable condition.
    pub fn push(&mut self, mut turn: Turn) {
        assert!(
            !self.status.is_terminal(),
            "attempt to append to a terminal trajectory"
        );
        turn.step_index = self.history.len();
        debug_assert!(turn.cost + 1e-9 >= self.total_cost, "cost must not decrease");
        self.total_cost = self.total_cost.max(turn.cost);
        self.history.push(turn);
    }

    /// Seal the trajectory with its terminal status and final patch.
    pub fn set_terminal(&mut self, status: Status, final_patch: String) {
        assert!(status.is_terminal(), "terminal status required");
        assert!(!self.status.is_terminal(), "trajectory already terminal");
        self.status = status;
        self.final_patch = final_patch;
    }
}

/// Persists a trajectory and its patch mirror.  Every write goes to a temp
/// file in the same directory and is renamed over the target, so a crash
/// never leaves a half-written file behind.
pub struct TrajectoryWriter {
    traj_path: PathBuf,
    patch_path: PathBuf,
}

impl TrajectoryWriter {
    pub fn new(output_dir: &Path, instance_key: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            traj_path: output_dir.join(format!("{instance_key}.traj.json")),
            patch_path: output_dir.join(format!("{instance_key}.patch")),
        })
    }

    pub fn traj_path(&self) -> &Path {
        &self.traj_path
    }

    /// Write the trajectory; on terminal status also mirror the patch.
    pub fn write(&self, trajectory: &Trajectory) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(trajectory)?;
        atomic_write(&self.traj_path, json.as_bytes())?;
        if trajectory.status.is_terminal() {
            atomic_write(&self.patch_path, trajectory.final_patch.as_bytes())?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Trajectory> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resume check: does a trajectory for this instance already exist in a
    /// terminal state?  Unreadable or partial files count as non-terminal,
    /// so they are re-run from scratch.
    pub fn existing_terminal_status(output_dir: &Path, instance_key: &str) -> Option<Status> {
        let path = output_dir.join(format!("{instance_key}.traj.json"));
        let trajectory = Self::load(&path).ok()?;
        trajectory.status.is_terminal().then_some(trajectory.status)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    std::io::Write::flush(&mut tmp)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
