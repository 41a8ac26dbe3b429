// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::Serialize;

use swea_core::Status;

/// One line in the batch progress stream.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Skipped { id: String, status: Status },
    Started { id: String, running: usize, total: usize },
    Finished { id: String, status: Status, cost: f64 },
    Failed { id: String, error: String },
}

/// Aggregated outcome of a batch run; serialised to `results.json`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost: f64,
    /// instance id → terminal status (or `error: ...`).
    pub instances: BTreeMap<String, String>,
}

impl BatchSummary {
    /// At least one instance reached a useful terminal status.
    pub fn any_useful_outcome(&self) -> bool {
        self.instances.values().any(|s| {
            s != "exit_environment" && s != "aborted" && !s.starts_with("error:")
        })
    }

    pub fn record(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::Skipped { id, status } => {
                self.skipped += 1;
                self.instances.insert(id.clone(), status.to_string());
            }
            BatchEvent::Started { .. } => {}
            BatchEvent::Finished { id, status, cost } => {
                self.completed += 1;
                if *status == Status::Submitted {
                    self.submitted += 1;
                }
                self.total_cost += cost;
                self.instances.insert(id.clone(), status.to_string());
            }
            BatchEvent::Failed { id, error } => {
                self.failed += 1;
                self.instances.insert(id.clone(), format!("error: {error}"));
            }
        }
    }
}

/// Render one event as a progress line.  All lines go through a single
/// consumer task, so output is never interleaved between workers.
pub fn event_line(event: &BatchEvent) -> String {
    match event {
        BatchEvent::Skipped { id, status } => {
            format!("[batch] skipped  {id} (already {status})")
        }
        BatchEvent::Started { id, running, total } => {
            format!("[batch] started  {id} ({running}/{total} in flight)")
        }
        BatchEvent::Finished { id, status, cost } => {
            format!("[batch] finished {id} -> {status} (cost {cost:.4})")
        }
        BatchEvent::Failed { id, error } => {
            format!("[batch] failed   {id}: {error}")
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
