// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};

use swea_config::Config;
use swea_core::{AgentLoop, Instance, Status, Trajectory, TrajectoryWriter};
use swea_env::{EnvController, EnvSpec};
use swea_model::{CostTracker, Model};
use swea_tools::ToolCatalogue;

use crate::progress::{event_line, BatchEvent, BatchSummary};

/// Builds the model client for one worker.  Injected so tests can drive the
/// pool with deterministic (or deliberately broken) models.
pub type ModelFactory =
    dyn Fn(&Instance) -> anyhow::Result<Arc<dyn Model>> + Send + Sync;

/// Fans the agent loop out over an instance set with bounded parallelism.
///
/// Workers are isolated: each owns its environment, model client, cost
/// tracker, and trajectory writer; a panic in one is captured at the join
/// point and recorded as a failure without touching the others.
pub struct BatchRunner {
    config: Arc<Config>,
    output_dir: PathBuf,
    redo: bool,
    model_factory: Arc<ModelFactory>,
}

impl BatchRunner {
    pub fn new(config: Arc<Config>, output_dir: PathBuf, redo: bool) -> Self {
        let model_config = config.agent.model.clone();
        Self {
            config,
            output_dir,
            redo,
            model_factory: Arc::new(move |_instance: &Instance| {
                swea_model::from_config(&model_config)
            }),
        }
    }

    /// Replace the model construction (tests, replay runs).
    pub fn with_model_factory(mut self, factory: Arc<ModelFactory>) -> Self {
        self.model_factory = factory;
        self
    }

    pub async fn run(
        &self,
        instances: Vec<Instance>,
        cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<BatchSummary> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        // Bundles are shared read-only across all workers.  When none are
        // configured the built-in bundle is materialized next to the output.
        let bundle_scratch = tempfile::tempdir().context("creating bundle scratch")?;
        let catalogue: Arc<ToolCatalogue> = if self.config.tools.bundles.is_empty() {
            Arc::new(swea_tools::builtin_catalogue(bundle_scratch.path())?)
        } else {
            Arc::new(swea_tools::load_catalogue(&self.config.tools.bundles)?)
        };

        let total = instances.len();
        let run_cost = Arc::new(Mutex::new(0.0_f64));
        let semaphore = Arc::new(Semaphore::new(self.config.num_workers));
        let (event_tx, event_rx) = mpsc::unbounded_channel::<BatchEvent>();

        // Single consumer: every progress line and every summary update goes
        // through this task, so nothing interleaves.
        let reporter = tokio::spawn(consume_events(event_rx, total));

        let mut handles = Vec::with_capacity(total);
        for instance in instances {
            let key = instance.sanitized_id();
            if !self.redo {
                if let Some(status) =
                    TrajectoryWriter::existing_terminal_status(&self.output_dir, &key)
                {
                    let _ = event_tx.send(BatchEvent::Skipped {
                        id: instance.id.clone(),
                        status,
                    });
                    continue;
                }
            }

            let config = Arc::clone(&self.config);
            let catalogue = Arc::clone(&catalogue);
            let factory = Arc::clone(&self.model_factory);
            let run_cost = Arc::clone(&run_cost);
            let output_dir = self.output_dir.clone();
            let events = event_tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let id = instance.id.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("worker semaphore closed");
                let _ = events.send(BatchEvent::Started {
                    id: instance.id.clone(),
                    running: config.num_workers
                        - semaphore.available_permits().min(config.num_workers),
                    total,
                });
                run_one(
                    &config,
                    catalogue,
                    factory,
                    run_cost,
                    &output_dir,
                    instance,
                    cancel,
                )
                .await
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(trajectory)) => {
                    let _ = event_tx.send(BatchEvent::Finished {
                        id,
                        status: trajectory.status,
                        cost: trajectory.total_cost,
                    });
                }
                Ok(Err(e)) => {
                    let _ = event_tx.send(BatchEvent::Failed {
                        id,
                        error: format!("{e:#}"),
                    });
                }
                Err(join_error) => {
                    // A panicking worker must not take the batch down.
                    warn!(%id, %join_error, "worker crashed");
                    let _ = event_tx.send(BatchEvent::Failed {
                        id,
                        error: format!("worker crashed: {join_error}"),
                    });
                }
            }
        }
        drop(event_tx);

        let mut summary = reporter.await.context("progress reporter crashed")?;
        summary.total = total;
        let results_path = self.output_dir.join("results.json");
        std::fs::write(&results_path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("writing {}", results_path.display()))?;
        info!(
            submitted = summary.submitted,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cost = summary.total_cost,
            "batch finished"
        );
        Ok(summary)
    }
}

async fn consume_events(
    mut rx: mpsc::UnboundedReceiver<BatchEvent>,
    _total: usize,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    while let Some(event) = rx.recv().await {
        println!("{}", event_line(&event));
        summary.record(&event);
    }
    summary
}

/// Drive one instance end to end.  Everything instance-scoped is owned here;
/// the only shared state is the read-only catalogue and the run cost cell.
async fn run_one(
    config: &Arc<Config>,
    catalogue: Arc<ToolCatalogue>,
    factory: Arc<ModelFactory>,
    run_cost: Arc<Mutex<f64>>,
    output_dir: &Path,
    instance: Instance,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<Trajectory> {
    let key = instance.sanitized_id();
    let writer = TrajectoryWriter::new(output_dir, &key)?;

    // Cancelled before setup: record the abort without bringing up an
    // environment.
    if *cancel.borrow() {
        let mut trajectory = Trajectory::new(&instance.id);
        trajectory.set_terminal(Status::Aborted, String::new());
        writer.write(&trajectory)?;
        return Ok(trajectory);
    }

    let spec = EnvSpec {
        image: instance.image.clone(),
        repo: instance.repo.clone(),
        setup: instance.setup.clone(),
    };
    let env = EnvController::prepare(&config.env, &config.tools, &catalogue, &spec)
        .await
        .with_context(|| format!("preparing environment for {}", instance.id))?;

    let model = factory(&instance)?;
    let cost = CostTracker::with_shared_total(
        config.agent.model.per_instance_cost_limit,
        config.agent.model.total_cost_limit,
        run_cost,
    );

    let agent = AgentLoop::new(
        model,
        catalogue,
        env,
        Arc::clone(config),
        cost,
        writer,
        &instance.id,
        cancel,
    );
    agent.run(&instance).await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
