// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use crate::Usage;

/// The cost ceiling that was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostScope {
    Instance,
    Total,
}

#[derive(Debug, thiserror::Error)]
#[error("{scope:?} cost limit exceeded: spent {spent:.4} of {limit:.4} USD")]
pub struct CostExceeded {
    pub scope: CostScope,
    pub spent: f64,
    pub limit: f64,
}

/// Per-instance cost accounting with an optional shared run-wide ceiling.
///
/// One tracker exists per agent loop; the `total` cell is shared across all
/// workers of a batch run.  Charges are applied before the limit check so a
/// query that crosses the ceiling is still recorded — the caller terminates
/// the instance instead of executing the parsed action.
pub struct CostTracker {
    instance: Usage,
    instance_limit: f64,
    total: Arc<Mutex<f64>>,
    total_limit: f64,
}

impl CostTracker {
    /// A tracker with its own private total cell (single-run use).
    pub fn new(instance_limit: f64, total_limit: f64) -> Self {
        Self::with_shared_total(instance_limit, total_limit, Arc::new(Mutex::new(0.0)))
    }

    /// A tracker sharing the run-wide total with other workers.
    pub fn with_shared_total(
        instance_limit: f64,
        total_limit: f64,
        total: Arc<Mutex<f64>>,
    ) -> Self {
        Self {
            instance: Usage::default(),
            instance_limit,
            total,
            total_limit,
        }
    }

    /// Record one query's usage, then enforce both ceilings.
    /// A limit of 0 disables that ceiling.
    pub fn charge(&mut self, usage: &Usage) -> Result<(), CostExceeded> {
        let usage = Usage {
            // Defects in provider accounting must never make cost go down.
            cost: usage.cost.max(0.0),
            ..*usage
        };
        self.instance.add(&usage);
        let run_total = {
            let mut total = self.total.lock().expect("cost cell poisoned");
            *total += usage.cost;
            *total
        };

        // The ceilings are strict: a run that lands exactly on the limit may
        // still act on the reply it just paid for.
        if self.instance_limit > 0.0 && self.instance.cost > self.instance_limit {
            return Err(CostExceeded {
                scope: CostScope::Instance,
                spent: self.instance.cost,
                limit: self.instance_limit,
            });
        }
        if self.total_limit > 0.0 && run_total > self.total_limit {
            return Err(CostExceeded {
                scope: CostScope::Total,
                spent: run_total,
                limit: self.total_limit,
            });
        }
        Ok(())
    }

    /// Cumulative usage for this instance.
    pub fn instance_usage(&self) -> &Usage {
        &self.instance
    }

    pub fn instance_cost(&self) -> f64 {
        self.instance.cost
    }

    pub fn run_cost(&self) -> f64 {
        *self.total.lock().expect("cost cell poisoned")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
