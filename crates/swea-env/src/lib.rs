// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The sandboxed execution environment: a long-lived shell session with
//! framed command execution, and the per-instance environment controller
//! that prepares containers, repositories, and tool installs.

mod controller;
mod docker;
mod session;

pub use controller::{EnvController, EnvInfo, EnvSpec, RepoSource, SessionState};
pub use session::{ExecResult, InterruptHandle, SessionOptions, SessionShell, ShellSpawn};

/// Environment failures.  `Unreachable` terminates the instance; `Bootstrap`
/// failures happen during preparation and carry the stage (bundle name,
/// `setup`, `checkout`) that failed.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("environment unreachable: {0}")]
    Unreachable(String),
    #[error("environment bootstrap failed at {stage}: {detail}")]
    Bootstrap { stage: String, detail: String },
}
