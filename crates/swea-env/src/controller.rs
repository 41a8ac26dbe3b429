// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use swea_config::{DeploymentKind, EnvConfig, RepoConfig, ToolsConfig};
use swea_tools::{TimeoutClass, ToolCatalogue};

use crate::docker;
use crate::session::{ExecResult, SessionOptions, SessionShell, ShellSpawn};
use crate::EnvError;

/// Where the task repository comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoSource {
    /// Clone from a remote URL, optionally pinning a commit.
    Remote {
        url: String,
        commit: Option<String>,
    },
    /// Copy a local checkout into the sandbox.
    Local { path: PathBuf },
    /// The base image already contains the repository at this path.
    Preexisting { path: PathBuf },
    /// No repository; the agent gets a bare working directory.
    None,
}

impl RepoSource {
    pub fn from_config(repo: &RepoConfig) -> Self {
        if let Some(url) = &repo.github_url {
            RepoSource::Remote {
                url: url.clone(),
                commit: repo.base_commit.clone(),
            }
        } else if let Some(path) = &repo.path {
            RepoSource::Local { path: path.clone() }
        } else if let Some(path) = &repo.image_path {
            RepoSource::Preexisting { path: path.clone() }
        } else {
            RepoSource::None
        }
    }

    /// Stable description used in the prepared-environment cache key.
    fn cache_facet(&self) -> String {
        match self {
            RepoSource::Remote { url, commit } => {
                format!("remote:{url}@{}", commit.as_deref().unwrap_or("HEAD"))
            }
            RepoSource::Local { path } => format!("local:{}", path.display()),
            RepoSource::Preexisting { path } => format!("image:{}", path.display()),
            RepoSource::None => "none".into(),
        }
    }
}

/// Everything needed to prepare one environment.
#[derive(Debug, Clone)]
pub struct EnvSpec {
    pub image: String,
    pub repo: RepoSource,
    pub setup: Option<String>,
}

/// Observable editor/shell state gathered after each action via the hidden
/// state-inspection command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub open_file: Option<String>,
    #[serde(default)]
    pub cursor_line: Option<u64>,
    #[serde(default)]
    pub env_snapshot: HashMap<String, String>,
}

/// Details recorded in the trajectory about the prepared environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvInfo {
    pub image: String,
    pub deployment: String,
    pub base_commit: Option<String>,
    /// Set when patch extraction is undefined for the repo source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_note: Option<String>,
}

#[derive(Debug)]
enum Deployment {
    Docker { container: String },
    Local { scratch: tempfile::TempDir },
}

/// Owns one prepared sandbox: the session shell plus everything recorded
/// about the environment (base commit, install state).  Construction runs
/// the full preparation sequence; dropping the controller without `close`
/// leaves a container behind, so callers always close.
#[derive(Debug)]
pub struct EnvController {
    session: SessionShell,
    deployment: Deployment,
    config: EnvConfig,
    repo_dir: String,
    base_commit: Option<String>,
    patch_note: Option<String>,
    image: String,
    /// Env keys reported in each state snapshot.
    state_env_keys: Vec<String>,
}

impl EnvController {
    /// Prepare a per-instance environment: image, container, repository,
    /// setup script, tools, base commit.  Idempotent where possible; a cache
    /// hit on (image, repo, setup) skips the expensive middle steps.
    pub async fn prepare(
        config: &EnvConfig,
        tools_config: &ToolsConfig,
        catalogue: &ToolCatalogue,
        spec: &EnvSpec,
    ) -> Result<Self, EnvError> {
        let long = Duration::from_secs(config.long_action_timeout_secs);
        let options = SessionOptions {
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            output_cap_bytes: config.output_cap_bytes,
        };

        // Seed declared env vars into every (re)built shell.
        let mut env_defaults = catalogue.env_defaults();
        env_defaults.extend(tools_config.env.clone());
        let mut init_commands: Vec<String> = env_defaults
            .iter()
            .map(|(k, v)| format!("export {k}='{}'", v.replace('\'', r"'\''")))
            .collect();
        init_commands.sort();
        let state_env_keys: Vec<String> = {
            let mut keys: Vec<String> = env_defaults.keys().cloned().collect();
            keys.sort();
            keys
        };

        let cache_tag = cache_tag(spec);
        let mut cached = false;

        let (deployment, spawn, repo_root) = match config.deployment {
            DeploymentKind::Docker => {
                let mut image = spec.image.clone();
                if config.cache_prepared && docker::image_exists(&cache_tag, long).await {
                    info!(%cache_tag, "using prepared environment image");
                    image = cache_tag.clone();
                    cached = true;
                } else if !docker::image_exists(&image, long).await {
                    info!(%image, "pulling base image");
                    docker::pull(&image, long).await?;
                }
                let container = docker::start_container(&image, long).await?;
                let spawn = ShellSpawn::docker_exec(&container);
                (
                    Deployment::Docker { container },
                    spawn,
                    "/workspace".to_string(),
                )
            }
            DeploymentKind::Local => {
                let scratch = tempfile::tempdir()
                    .map_err(|e| EnvError::Unreachable(format!("creating scratch dir: {e}")))?;
                let root = scratch.path().to_string_lossy().into_owned();
                let spawn = ShellSpawn::local_bash(Some(scratch.path().to_path_buf()));
                (Deployment::Local { scratch }, spawn, root)
            }
        };

        let session = SessionShell::start(spawn, init_commands, options).await?;
        let mut controller = Self {
            session,
            deployment,
            config: config.clone(),
            repo_dir: repo_root.clone(),
            base_commit: None,
            patch_note: None,
            image: spec.image.clone(),
            state_env_keys,
        };

        // From here on a failure must tear the sandbox down again, or every
        // bad setup script would leak a running container.
        match controller
            .prepare_steps(tools_config, catalogue, spec, &repo_root, cached, &cache_tag)
            .await
        {
            Ok(()) => Ok(controller),
            Err(e) => {
                controller.close().await;
                Err(e)
            }
        }
    }

    async fn prepare_steps(
        &mut self,
        tools_config: &ToolsConfig,
        catalogue: &ToolCatalogue,
        spec: &EnvSpec,
        repo_root: &str,
        cached: bool,
        cache_tag: &str,
    ) -> Result<(), EnvError> {
        let long = Duration::from_secs(self.config.long_action_timeout_secs);

        if cached {
            // Repo, setup, and tools are baked into the image; only the
            // in-memory bookkeeping and the rc sourcing have to be redone.
            self.repo_dir = repo_dir_for(&spec.repo, repo_root);
            if matches!(spec.repo, RepoSource::None) {
                self.patch_note =
                    Some("no repository source; patch extraction undefined".into());
            }
            self.register_rc_files(tools_config, catalogue).await?;
        } else {
            self.materialize_repo(&spec.repo, repo_root).await?;
            self.run_setup(spec.setup.as_deref()).await?;
            self.install_tools(tools_config, catalogue).await?;
        }

        self.record_base_commit(&spec.repo).await?;
        // Enter the repo now and on every shell rebuild.
        let enter_repo = format!("cd '{}'", self.repo_dir);
        self.exec_raw(&enter_repo, long).await?;
        self.session.add_init_command(enter_repo);

        if !cached && self.config.cache_prepared {
            if let Deployment::Docker { container } = &self.deployment {
                if let Err(e) = docker::commit(container, cache_tag, long).await {
                    warn!(error = %e, "could not cache prepared environment");
                }
            }
        }
        Ok(())
    }

    // ── Preparation steps ────────────────────────────────────────────────────

    async fn materialize_repo(
        &mut self,
        repo: &RepoSource,
        root: &str,
    ) -> Result<(), EnvError> {
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        match repo {
            RepoSource::Remote { url, commit } => {
                let clone = format!("git clone --quiet '{url}' '{root}/repo'");
                let result = self.exec_raw(&clone, long).await?;
                if result.exit_code != 0 {
                    return Err(EnvError::Bootstrap {
                        stage: "checkout".into(),
                        detail: result.stdout,
                    });
                }
                if let Some(commit) = commit {
                    let checkout =
                        format!("git -C '{root}/repo' checkout --quiet '{commit}'");
                    let result = self.exec_raw(&checkout, long).await?;
                    if result.exit_code != 0 {
                        return Err(EnvError::Bootstrap {
                            stage: "checkout".into(),
                            detail: result.stdout,
                        });
                    }
                }
                self.repo_dir = format!("{root}/repo");
            }
            RepoSource::Local { path } => {
                let dest = format!("{root}/repo");
                self.copy_into_sandbox(path, &dest).await?;
                // A copied tree may not be a git repo; anchor it so the final
                // diff has a base commit.
                let init = format!(
                    "if [ ! -d '{dest}/.git' ]; then \
                       git -C '{dest}' init --quiet && \
                       git -C '{dest}' add -A && \
                       git -C '{dest}' -c user.name=swea -c user.email=swea@localhost \
                         commit --quiet -m 'base snapshot'; fi"
                );
                let result = self.exec_raw(&init, long).await?;
                if result.exit_code != 0 {
                    return Err(EnvError::Bootstrap {
                        stage: "checkout".into(),
                        detail: result.stdout,
                    });
                }
                self.repo_dir = dest;
            }
            RepoSource::Preexisting { path } => {
                self.repo_dir = path.to_string_lossy().into_owned();
            }
            RepoSource::None => {
                self.repo_dir = root.to_string();
                self.patch_note =
                    Some("no repository source; patch extraction undefined".into());
            }
        }
        Ok(())
    }

    async fn run_setup(&mut self, setup: Option<&str>) -> Result<(), EnvError> {
        let Some(script) = setup else { return Ok(()) };
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        let command = format!("cd '{}' && {script}", self.repo_dir);
        let result = self.exec_raw(&command, long).await?;
        if result.timed_out || result.exit_code != 0 {
            return Err(EnvError::Bootstrap {
                stage: "setup".into(),
                detail: result.stdout,
            });
        }
        Ok(())
    }

    /// The configured install root is an in-sandbox path; for the local
    /// deployment it is remapped under the scratch directory so tool installs
    /// never touch the host filesystem.
    fn install_root(&self, tools_config: &ToolsConfig) -> String {
        match &self.deployment {
            Deployment::Docker { .. } => {
                tools_config.install_root.to_string_lossy().into_owned()
            }
            Deployment::Local { scratch } => scratch
                .path()
                .join("tools")
                .to_string_lossy()
                .into_owned(),
        }
    }

    /// Install protocol: copy bundle files to a stable path, run the install
    /// step once, register `source <bundle>/bash.rc` for every shell.
    async fn install_tools(
        &mut self,
        tools_config: &ToolsConfig,
        catalogue: &ToolCatalogue,
    ) -> Result<(), EnvError> {
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        let install_root = self.install_root(tools_config);

        for bundle in catalogue.bundles() {
            let dest = format!("{install_root}/{}", bundle.name);
            self.exec_raw(&format!("mkdir -p '{install_root}'"), long)
                .await?;
            self.copy_into_sandbox(&bundle.source_dir, &dest).await?;

            if let Some(install) = &bundle.install {
                let command = format!("cd '{dest}' && {install}");
                let result = self.exec_raw(&command, long).await?;
                if result.timed_out || result.exit_code != 0 {
                    return Err(EnvError::Bootstrap {
                        stage: bundle.name.clone(),
                        detail: result.stdout,
                    });
                }
            }

            if bundle.rc_file().is_some() {
                let source = format!("source '{dest}/bash.rc'");
                let result = self.exec_raw(&source, long).await?;
                if result.exit_code != 0 {
                    return Err(EnvError::Bootstrap {
                        stage: bundle.name.clone(),
                        detail: result.stdout,
                    });
                }
                self.session.add_init_command(source);
            }
        }
        Ok(())
    }

    /// Cache-hit path: the files are already in the image; just source rc.
    async fn register_rc_files(
        &mut self,
        tools_config: &ToolsConfig,
        catalogue: &ToolCatalogue,
    ) -> Result<(), EnvError> {
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        let install_root = self.install_root(tools_config);
        for bundle in catalogue.bundles() {
            if bundle.rc_file().is_some() {
                let source = format!("source '{install_root}/{}/bash.rc'", bundle.name);
                let result = self.exec_raw(&source, long).await?;
                if result.exit_code != 0 {
                    return Err(EnvError::Bootstrap {
                        stage: bundle.name.clone(),
                        detail: result.stdout,
                    });
                }
                self.session.add_init_command(source);
            }
        }
        Ok(())
    }

    async fn record_base_commit(&mut self, repo: &RepoSource) -> Result<(), EnvError> {
        if matches!(repo, RepoSource::None) {
            return Ok(());
        }
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        let result = self
            .exec_raw(
                &format!("git -C '{}' rev-parse HEAD", self.repo_dir),
                long,
            )
            .await?;
        if result.exit_code == 0 {
            self.base_commit = Some(result.stdout.trim().to_string());
        } else {
            self.patch_note =
                Some("repository is not a git tree; patch extraction undefined".into());
        }
        Ok(())
    }

    async fn copy_into_sandbox(&mut self, src: &Path, dest: &str) -> Result<(), EnvError> {
        match &self.deployment {
            Deployment::Docker { container } => {
                let long = Duration::from_secs(self.config.long_action_timeout_secs);
                docker::copy_in(container, src, dest, long).await
            }
            Deployment::Local { .. } => copy_tree(src, Path::new(dest)),
        }
    }

    // ── Runtime surface ──────────────────────────────────────────────────────

    /// The wall-clock budget for an action class, in seconds.
    pub fn timeout_secs(&self, class: TimeoutClass) -> u64 {
        match class {
            TimeoutClass::Short => self.config.action_timeout_secs,
            TimeoutClass::Long => self.config.long_action_timeout_secs,
        }
    }

    /// Dispatch one action command with its class timeout.
    pub async fn exec_action(
        &mut self,
        command: &str,
        class: TimeoutClass,
    ) -> Result<ExecResult, EnvError> {
        let timeout = match class {
            TimeoutClass::Short => Duration::from_secs(self.config.action_timeout_secs),
            TimeoutClass::Long => Duration::from_secs(self.config.long_action_timeout_secs),
        };
        let no_output = Duration::from_secs(self.config.no_output_timeout_secs);
        self.session.exec(command, timeout, no_output).await
    }

    async fn exec_raw(&mut self, command: &str, timeout: Duration) -> Result<ExecResult, EnvError> {
        let no_output = timeout;
        self.session.exec(command, timeout, no_output).await
    }

    /// Gather the observable session state via the hidden inspection command.
    /// The command never reaches the trajectory as an action of its own; its
    /// output is attached to the surrounding observation.
    pub async fn state(&mut self) -> Result<SessionState, EnvError> {
        let timeout = Duration::from_secs(self.config.action_timeout_secs);
        let result = self
            .exec_raw(
                "type _session_state >/dev/null 2>&1 && _session_state \
                 || printf '{\"cwd\": \"%s\"}\\n' \"$PWD\"",
                timeout,
            )
            .await?;
        let mut state: SessionState =
            serde_json::from_str(result.stdout.trim()).unwrap_or_default();
        if state.open_file.as_deref() == Some("") {
            state.open_file = None;
        }

        if !self.state_env_keys.is_empty() {
            let probes: Vec<String> = self
                .state_env_keys
                .iter()
                .map(|k| format!("printf '%s=%s\\n' '{k}' \"${{{k}}}\""))
                .collect();
            let result = self.exec_raw(&probes.join("; "), timeout).await?;
            for line in result.stdout.lines() {
                if let Some((k, v)) = line.split_once('=') {
                    state.env_snapshot.insert(k.to_string(), v.to_string());
                }
            }
        }
        Ok(state)
    }

    /// Recompute the final patch by diffing the working tree against the
    /// recorded base commit.  Deterministic for a given repository state.
    pub async fn diff(&mut self) -> Result<String, EnvError> {
        let Some(base) = self.base_commit.clone() else {
            return Ok(String::new());
        };
        let long = Duration::from_secs(self.config.long_action_timeout_secs);
        let command = format!(
            "git -C '{dir}' add -A >/dev/null && git -C '{dir}' diff --cached '{base}'",
            dir = self.repo_dir
        );
        let result = self.exec_raw(&command, long).await?;
        if result.exit_code != 0 {
            warn!(code = result.exit_code, "final diff failed");
            return Ok(String::new());
        }
        Ok(result.stdout)
    }

    pub fn interrupt(&self) {
        self.session.interrupt();
    }

    /// Interrupt capability usable while an exec borrow is outstanding.
    pub fn interrupt_handle(&self) -> crate::session::InterruptHandle {
        self.session.interrupt_handle()
    }

    /// Shut down the shell and remove the sandbox.
    pub async fn close(self) {
        self.session.close().await;
        if let Deployment::Docker { container } = &self.deployment {
            docker::remove(container).await;
        }
    }

    pub fn env_info(&self) -> EnvInfo {
        EnvInfo {
            image: self.image.clone(),
            deployment: match self.deployment {
                Deployment::Docker { .. } => "docker".into(),
                Deployment::Local { .. } => "local".into(),
            },
            base_commit: self.base_commit.clone(),
            patch_note: self.patch_note.clone(),
        }
    }

    pub fn base_commit(&self) -> Option<&str> {
        self.base_commit.as_deref()
    }

    pub fn repo_dir(&self) -> &str {
        &self.repo_dir
    }
}

/// Where the repository lands inside the sandbox for a given source.
fn repo_dir_for(repo: &RepoSource, root: &str) -> String {
    match repo {
        RepoSource::Remote { .. } | RepoSource::Local { .. } => format!("{root}/repo"),
        RepoSource::Preexisting { path } => path.to_string_lossy().into_owned(),
        RepoSource::None => root.to_string(),
    }
}

/// Cache identity of a prepared environment.  Everything that affects steps
/// 3–5 of preparation participates; nothing else may.
fn cache_tag(spec: &EnvSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.image.as_bytes());
    hasher.update(b"\0");
    hasher.update(spec.repo.cache_facet().as_bytes());
    hasher.update(b"\0");
    hasher.update(spec.setup.as_deref().unwrap_or("").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("swea-cache:{}", &digest[..16])
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), EnvError> {
    let map_err = |e: std::io::Error| EnvError::Unreachable(format!("copying repo: {e}"));
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| EnvError::Unreachable(format!("walking {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(map_err)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(map_err)?;
            }
            std::fs::copy(entry.path(), &target).map_err(map_err)?;
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> EnvConfig {
        EnvConfig {
            deployment: DeploymentKind::Local,
            cache_prepared: false,
            ..Default::default()
        }
    }

    fn catalogue(dir: &Path) -> ToolCatalogue {
        swea_tools::builtin_catalogue(dir).unwrap()
    }

    async fn prepared_with_repo() -> (EnvController, tempfile::TempDir, tempfile::TempDir) {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("greeting.txt"), "hello\n").unwrap();
        let bundles = tempfile::tempdir().unwrap();
        let cat = catalogue(bundles.path());
        let spec = EnvSpec {
            image: "unused".into(),
            repo: RepoSource::Local {
                path: repo.path().to_path_buf(),
            },
            setup: None,
        };
        let controller =
            EnvController::prepare(&local_config(), &ToolsConfig::default(), &cat, &spec)
                .await
                .expect("prepare local env");
        (controller, repo, bundles)
    }

    #[test]
    fn repo_source_from_config_picks_the_set_field() {
        let remote = RepoConfig {
            github_url: Some("https://example.com/r.git".into()),
            base_commit: Some("abc".into()),
            ..Default::default()
        };
        assert!(matches!(
            RepoSource::from_config(&remote),
            RepoSource::Remote { .. }
        ));
        assert_eq!(
            RepoSource::from_config(&RepoConfig::default()),
            RepoSource::None
        );
    }

    #[test]
    fn cache_tag_depends_on_all_facets() {
        let base = EnvSpec {
            image: "python:3.11".into(),
            repo: RepoSource::None,
            setup: None,
        };
        let other_image = EnvSpec {
            image: "python:3.12".into(),
            ..base.clone()
        };
        let other_setup = EnvSpec {
            setup: Some("pip install flask".into()),
            ..base.clone()
        };
        assert_ne!(cache_tag(&base), cache_tag(&other_image));
        assert_ne!(cache_tag(&base), cache_tag(&other_setup));
        assert_eq!(cache_tag(&base), cache_tag(&base.clone()));
    }

    #[tokio::test]
    async fn prepare_local_records_base_commit() {
        let (controller, _repo, _bundles) = prepared_with_repo().await;
        assert!(controller.base_commit().is_some());
        assert!(controller.env_info().patch_note.is_none());
        controller.close().await;
    }

    #[tokio::test]
    async fn diff_is_empty_on_untouched_repo() {
        let (mut controller, _repo, _bundles) = prepared_with_repo().await;
        let patch = controller.diff().await.unwrap();
        assert!(patch.is_empty(), "untouched repo must produce an empty patch");
        controller.close().await;
    }

    #[tokio::test]
    async fn diff_reflects_edits() {
        let (mut controller, _repo, _bundles) = prepared_with_repo().await;
        let result = controller
            .exec_action("echo changed >> greeting.txt", TimeoutClass::Short)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        let patch = controller.diff().await.unwrap();
        assert!(patch.contains("greeting.txt"));
        assert!(patch.contains("+changed"));
        controller.close().await;
    }

    #[tokio::test]
    async fn state_reports_cwd_and_env_snapshot() {
        let (mut controller, _repo, _bundles) = prepared_with_repo().await;
        let state = controller.state().await.unwrap();
        assert!(state.cwd.ends_with("repo"));
        assert_eq!(state.env_snapshot.get("WINDOW").map(String::as_str), Some("100"));
        controller.close().await;
    }

    #[tokio::test]
    async fn builtin_tools_are_usable_in_session() {
        let (mut controller, _repo, _bundles) = prepared_with_repo().await;
        let result = controller
            .exec_action("open greeting.txt", TimeoutClass::Short)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0, "{}", result.stdout);
        assert!(result.stdout.contains("greeting.txt"));
        assert!(result.stdout.contains("hello"));
        controller.close().await;
    }

    #[tokio::test]
    async fn no_repo_source_sets_patch_note() {
        let bundles = tempfile::tempdir().unwrap();
        let cat = catalogue(bundles.path());
        let spec = EnvSpec {
            image: "unused".into(),
            repo: RepoSource::None,
            setup: None,
        };
        let mut controller =
            EnvController::prepare(&local_config(), &ToolsConfig::default(), &cat, &spec)
                .await
                .unwrap();
        assert!(controller.env_info().patch_note.is_some());
        assert!(controller.diff().await.unwrap().is_empty());
        controller.close().await;
    }

    #[tokio::test]
    async fn failing_setup_is_bootstrap_error() {
        let bundles = tempfile::tempdir().unwrap();
        let cat = catalogue(bundles.path());
        let spec = EnvSpec {
            image: "unused".into(),
            repo: RepoSource::None,
            setup: Some("false".into()),
        };
        let err = EnvController::prepare(&local_config(), &ToolsConfig::default(), &cat, &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Bootstrap { stage, .. } if stage == "setup"));
    }
}
