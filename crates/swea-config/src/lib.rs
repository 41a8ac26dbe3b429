// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{apply_override, load, merge_yaml, ConfigError};
pub use schema::{
    ActionsConfig, AgentConfig, Config, DeploymentKind, EnvConfig, HistoryProcessorConfig,
    InstanceSourceKind, InstancesConfig, ModelConfig, ProblemStatementConfig, RepoConfig,
    ToolsConfig,
};
