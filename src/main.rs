// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use cli::{Cli, Commands, CommonRunArgs};
use swea_batch::{load_instances, BatchRunner};
use swea_config::Config;
use swea_core::{AgentLoop, Instance, Role, Status, Trajectory, TrajectoryWriter};
use swea_env::{EnvController, EnvSpec, RepoSource};
use swea_model::CostTracker;
use swea_tools::ToolCatalogue;

// ── Exit codes ────────────────────────────────────────────────────────────────

const EXIT_SUCCESS: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_ENVIRONMENT_ERROR: u8 = 2;
const EXIT_INTERRUPT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("sweagent: {error:#}");
            ExitCode::from(classify_error(&error))
        }
    }
}

/// Map an error chain onto the documented exit codes: configuration defects
/// are 1, unrecoverable environment failures are 2.
fn classify_error(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.downcast_ref::<swea_config::ConfigError>().is_some()
            || cause.downcast_ref::<swea_tools::BundleError>().is_some()
        {
            return EXIT_CONFIG_ERROR;
        }
        if cause.downcast_ref::<swea_env::EnvError>().is_some() {
            return EXIT_ENVIRONMENT_ERROR;
        }
    }
    EXIT_CONFIG_ERROR
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(EXIT_SUCCESS)
        }
        Commands::ShowConfig { config, set } => {
            let overrides = parse_set_entries(&set)?;
            let config = swea_config::load(&config, &overrides)?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(EXIT_SUCCESS)
        }
        Commands::Inspector { dir, instance } => run_inspector(&dir, instance.as_deref()),
        Commands::TrajToDemo { traj_path, output } => traj_to_demo(&traj_path, output),
        Commands::Run {
            common,
            instance_id,
            problem_text,
            problem_path,
            problem_github_url,
            repo_github_url,
            repo_path,
            repo_image_path,
            apply_patch_locally,
            open_pr,
        } => {
            let mut overrides = common.overrides()?;
            push_opt(&mut overrides, "problem_statement.text", &problem_text);
            push_opt_path(&mut overrides, "problem_statement.path", &problem_path);
            push_opt(&mut overrides, "problem_statement.github_url", &problem_github_url);
            push_opt(&mut overrides, "env.repo.github_url", &repo_github_url);
            push_opt_path(&mut overrides, "env.repo.path", &repo_path);
            push_opt_path(&mut overrides, "env.repo.image_path", &repo_image_path);
            if apply_patch_locally {
                overrides.push(("actions.apply_patch_locally".into(), "true".into()));
            }
            if open_pr {
                overrides.push(("actions.open_pr".into(), "true".into()));
            }
            let config = Arc::new(swea_config::load(&common.config, &overrides)?);
            run_single(&common, config, instance_id, None).await
        }
        Commands::RunReplay {
            common,
            traj_path,
            repo_path,
        } => {
            let mut overrides = common.overrides()?;
            overrides.push(("agent.model.name".into(), "replay".into()));
            overrides.push((
                "agent.model.replay_path".into(),
                traj_path.to_string_lossy().into_owned(),
            ));
            push_opt_path(&mut overrides, "env.repo.path", &repo_path);
            let config = Arc::new(swea_config::load(&common.config, &overrides)?);
            let recorded = TrajectoryWriter::load(&traj_path)
                .with_context(|| format!("loading {}", traj_path.display()))?;
            let problem = recorded
                .history
                .iter()
                .find(|t| t.role == Role::User)
                .map(|t| t.thought.clone())
                .unwrap_or_default();
            let instance_id = format!("{}-replay", recorded.instance_id);
            run_single(&common, config, instance_id, Some(problem)).await
        }
        Commands::RunBatch {
            common,
            instances_type,
            instances_path,
            instances_subset,
            instances_split,
            instances_slice,
            instances_shuffle,
            num_workers,
            redo,
            preview,
        } => {
            let mut overrides = common.overrides()?;
            push_opt(&mut overrides, "instances.type", &instances_type);
            push_opt(&mut overrides, "instances.path", &instances_path);
            push_opt(&mut overrides, "instances.subset", &instances_subset);
            push_opt(&mut overrides, "instances.split", &instances_split);
            push_opt(&mut overrides, "instances.slice", &instances_slice);
            if instances_shuffle {
                overrides.push(("instances.shuffle".into(), "true".into()));
            }
            if let Some(n) = num_workers {
                overrides.push(("num_workers".into(), n.to_string()));
            }
            let config = Arc::new(swea_config::load(&common.config, &overrides)?);
            run_batch(&common, config, redo, preview).await
        }
    }
}

fn push_opt(overrides: &mut Vec<(String, String)>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        overrides.push((key.into(), value.clone()));
    }
}

fn push_opt_path(overrides: &mut Vec<(String, String)>, key: &str, value: &Option<PathBuf>) {
    if let Some(value) = value {
        overrides.push((key.into(), value.to_string_lossy().into_owned()));
    }
}

fn parse_set_entries(entries: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("--set expects KEY=VALUE, got {entry:?}"))
        })
        .collect()
}

// ── Single-instance run ───────────────────────────────────────────────────────

async fn run_single(
    common: &CommonRunArgs,
    config: Arc<Config>,
    instance_id: String,
    problem_override: Option<String>,
) -> anyhow::Result<u8> {
    let run_dir = make_run_dir(&config, common.run_id.as_deref())?;
    init_logging(common.verbose, Some(&run_dir.join("run.log")));
    info!(run_dir = %run_dir.display(), "starting single run");

    let problem_statement = match problem_override {
        Some(problem) => problem,
        None => resolve_problem_statement(&config).await?,
    };
    let instance = Instance {
        id: instance_id,
        problem_statement,
        extra_files: vec![],
        repo: RepoSource::from_config(&config.env.repo),
        image: config.env.image.clone(),
        setup: config.env.setup.clone(),
        evaluation: None,
    };

    let bundle_scratch = tempfile::tempdir().context("creating bundle scratch")?;
    let catalogue: Arc<ToolCatalogue> = if config.tools.bundles.is_empty() {
        Arc::new(swea_tools::builtin_catalogue(bundle_scratch.path())?)
    } else {
        Arc::new(swea_tools::load_catalogue(&config.tools.bundles)?)
    };

    let cancel = spawn_cancel_signal();
    let spec = EnvSpec {
        image: instance.image.clone(),
        repo: instance.repo.clone(),
        setup: instance.setup.clone(),
    };
    let env = EnvController::prepare(&config.env, &config.tools, &catalogue, &spec)
        .await
        .context("preparing the environment")?;

    let model = swea_model::from_config(&config.agent.model)?;
    let cost = CostTracker::new(
        config.agent.model.per_instance_cost_limit,
        config.agent.model.total_cost_limit,
    );
    let writer = TrajectoryWriter::new(&run_dir, &instance.sanitized_id())?;

    let agent = AgentLoop::new(
        model,
        catalogue,
        env,
        Arc::clone(&config),
        cost,
        writer,
        &instance.id,
        cancel,
    );
    let trajectory = agent.run(&instance).await?;
    println!(
        "instance {} finished: {} (cost {:.4}, {} turns)",
        trajectory.instance_id,
        trajectory.status,
        trajectory.total_cost,
        trajectory.history.len()
    );

    if trajectory.status == Status::Submitted {
        post_run_actions(&config, &trajectory)?;
    }

    Ok(match trajectory.status {
        Status::Aborted => EXIT_INTERRUPT,
        Status::ExitEnvironment => EXIT_ENVIRONMENT_ERROR,
        _ => EXIT_SUCCESS,
    })
}

/// Resolve the problem statement from inline text, a file, or a GitHub
/// issue URL (in that priority order).
async fn resolve_problem_statement(config: &Config) -> anyhow::Result<String> {
    let ps = &config.problem_statement;
    if let Some(text) = &ps.text {
        return Ok(text.clone());
    }
    if let Some(path) = &ps.path {
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading problem statement {}", path.display()));
    }
    if let Some(url) = &ps.github_url {
        return fetch_github_issue(url).await;
    }
    anyhow::bail!("no problem statement given; use --problem_statement.{{text|path|github_url}}")
}

async fn fetch_github_issue(url: &str) -> anyhow::Result<String> {
    // https://github.com/<owner>/<repo>/issues/<n> → the REST endpoint.
    let parts: Vec<&str> = url.trim_end_matches('/').split('/').collect();
    let n = parts.len();
    if n < 4 || parts[n - 2] != "issues" {
        anyhow::bail!("not a GitHub issue URL: {url}");
    }
    let (owner, repo, number) = (parts[n - 4], parts[n - 3], parts[n - 1]);
    let api = format!("https://api.github.com/repos/{owner}/{repo}/issues/{number}");
    let doc: serde_json::Value = reqwest::Client::new()
        .get(&api)
        .header("User-Agent", "sweagent")
        .send()
        .await
        .context("fetching issue")?
        .error_for_status()?
        .json()
        .await?;
    let title = doc["title"].as_str().unwrap_or_default();
    let body = doc["body"].as_str().unwrap_or_default();
    Ok(format!("{title}\n\n{body}"))
}

fn post_run_actions(config: &Config, trajectory: &Trajectory) -> anyhow::Result<()> {
    if config.actions.apply_patch_locally {
        let Some(repo) = &config.env.repo.path else {
            warn!("actions.apply_patch_locally set but env.repo.path is not a local checkout");
            return Ok(());
        };
        if trajectory.final_patch.is_empty() {
            info!("final patch is empty; nothing to apply");
        } else {
            let mut patch_file = tempfile::NamedTempFile::new()?;
            std::io::Write::write_all(&mut patch_file, trajectory.final_patch.as_bytes())?;
            let status = std::process::Command::new("git")
                .args(["-C", &repo.to_string_lossy(), "apply"])
                .arg(patch_file.path())
                .status()
                .context("running git apply")?;
            if status.success() {
                println!("applied final patch to {}", repo.display());
            } else {
                warn!("git apply failed with {status}");
            }
        }
    }
    if config.actions.open_pr {
        // PR plumbing is external tooling; the patch file next to the
        // trajectory is the hand-off artifact.
        println!("actions.open_pr: not handled here; use the written .patch file");
    }
    Ok(())
}

// ── Batch run ─────────────────────────────────────────────────────────────────

async fn run_batch(
    common: &CommonRunArgs,
    config: Arc<Config>,
    redo: bool,
    preview: bool,
) -> anyhow::Result<u8> {
    let run_dir = make_run_dir(&config, common.run_id.as_deref())?;
    init_logging(common.verbose, Some(&run_dir.join("run.log")));

    let instances = load_instances(&config.instances).await?;
    if preview {
        for (i, instance) in instances.iter().enumerate() {
            println!("{i:4}  {}", instance.id);
        }
        return Ok(EXIT_SUCCESS);
    }
    info!(
        count = instances.len(),
        workers = config.num_workers,
        run_dir = %run_dir.display(),
        "starting batch run"
    );

    let cancel = spawn_cancel_signal();
    let runner = BatchRunner::new(Arc::clone(&config), run_dir, redo);
    let summary = runner.run(instances, cancel.clone()).await?;

    if *cancel.borrow() {
        return Ok(EXIT_INTERRUPT);
    }
    Ok(if summary.any_useful_outcome() {
        EXIT_SUCCESS
    } else {
        EXIT_ENVIRONMENT_ERROR
    })
}

// ── Utilities ─────────────────────────────────────────────────────────────────

fn run_inspector(dir: &Path, instance: Option<&str>) -> anyhow::Result<u8> {
    init_logging(0, None);
    if let Some(id) = instance {
        let path = dir.join(format!("{id}.traj.json"));
        let trajectory = TrajectoryWriter::load(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        println!(
            "instance {} — {} ({} turns, cost {:.4})\n",
            trajectory.instance_id,
            trajectory.status,
            trajectory.history.len(),
            trajectory.total_cost
        );
        for turn in &trajectory.history {
            match (&turn.action, &turn.observation) {
                (Some(action), _) => {
                    println!("[{:3}] assistant: {}", turn.step_index, action.command);
                }
                (None, Some(observation)) => {
                    let excerpt: String = observation.output.chars().take(120).collect();
                    println!(
                        "[{:3}] observation (exit {}): {}",
                        turn.step_index,
                        observation.exit_code,
                        excerpt.replace('\n', " ")
                    );
                }
                (None, None) => {
                    let excerpt: String = turn.thought.chars().take(120).collect();
                    println!("[{:3}] {:?}: {}", turn.step_index, turn.role, excerpt.replace('\n', " "));
                }
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let mut rows = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        if !name.ends_with(".traj.json") {
            continue;
        }
        match TrajectoryWriter::load(&path) {
            Ok(t) => rows.push((t.instance_id, t.status.to_string(), t.history.len(), t.total_cost)),
            Err(e) => rows.push((name, format!("unreadable: {e}"), 0, 0.0)),
        }
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    println!("{:40}  {:18}  {:>6}  {:>8}", "instance", "status", "turns", "cost");
    for (id, status, turns, cost) in rows {
        println!("{id:40}  {status:18}  {turns:>6}  {cost:>8.4}");
    }
    Ok(EXIT_SUCCESS)
}

/// Strip a recorded trajectory down to the turns worth demonstrating:
/// successful actions and their observations.
fn traj_to_demo(traj_path: &Path, output: Option<PathBuf>) -> anyhow::Result<u8> {
    init_logging(0, None);
    let mut trajectory = TrajectoryWriter::load(traj_path)
        .with_context(|| format!("loading {}", traj_path.display()))?;

    let mut kept = Vec::new();
    for turn in trajectory.history.drain(..) {
        let keep = match turn.role {
            Role::Assistant => turn.action.is_some(),
            Role::ToolObservation => turn.observation.is_some(),
            _ => false,
        };
        if keep {
            let mut turn = turn;
            turn.is_demo = true;
            turn.step_index = kept.len();
            kept.push(turn);
        }
    }
    anyhow::ensure!(!kept.is_empty(), "trajectory has no demonstrable turns");
    trajectory.history = kept;

    let output = output.unwrap_or_else(|| {
        let stem = traj_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
            .replace(".traj.json", "");
        traj_path.with_file_name(format!("{stem}.demo.traj.json"))
    });
    std::fs::write(&output, serde_json::to_string_pretty(&trajectory)?)?;
    println!(
        "wrote {} demonstration turns to {}",
        trajectory.history.len(),
        output.display()
    );
    Ok(EXIT_SUCCESS)
}

fn make_run_dir(config: &Config, run_id: Option<&str>) -> anyhow::Result<PathBuf> {
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => chrono::Utc::now().format("run-%Y%m%d-%H%M%S").to_string(),
    };
    let dir = config.output_root.join(run_id);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

/// Ctrl-C flips the global cancellation flag seen by every worker.
fn spawn_cancel_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, cancelling workers");
            let _ = tx.send(true);
        }
        // Keep the sender alive so the flag stays observable.
        std::future::pending::<()>().await;
    });
    rx
}

/// Stream logging to stderr (level from -v or LOG_STREAM_LEVEL) and, when a
/// run directory exists, detailed logging to its run.log (LOG_FILE_LEVEL).
/// LOG_TIME=1 adds timestamps to the stream output.
fn init_logging(verbosity: u8, log_file: Option<&Path>) {
    use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, Layer, Registry};

    let default_stream = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let stream_level =
        std::env::var("LOG_STREAM_LEVEL").unwrap_or_else(|_| default_stream.to_string());
    let stream_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(stream_level));
    let show_time = std::env::var("LOG_TIME").map(|v| v == "1").unwrap_or(false);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let stream_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    layers.push(if show_time {
        stream_layer.with_filter(stream_filter).boxed()
    } else {
        stream_layer.without_time().with_filter(stream_filter).boxed()
    });

    if let Some(path) = log_file {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let file_level =
                std::env::var("LOG_FILE_LEVEL").unwrap_or_else(|_| "debug".to_string());
            layers.push(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(EnvFilter::new(file_level))
                    .boxed(),
            );
        }
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
}
