//! Aggregation audit log for post-hoc analysis.
//!
//! Records metadata about each SCAFFOLD round so that drift in the global
//! control variate can be traced back to the rounds that produced it.

use serde::{Deserialize, Serialize};

use crate::aggregators::UpdateWeighting;

/// Metadata for a single aggregation round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationAuditEntry {
    /// Round number (0-indexed).
    pub round: usize,
    /// Number of client updates aggregated.
    pub n_updates: usize,
    /// Sum of `num_samples` over the round's updates.
    pub total_samples: usize,
    /// Factor applied to the accumulated control-variate delta.
    pub scaling_factor: f32,
    /// Weighting policy applied to weight deltas.
    pub weighting: UpdateWeighting,
    /// L2 norm of the applied model step (`eta_g * delta_y_accum`).
    pub model_step_norm: f32,
    /// L2 norm of the applied control-variate step.
    pub control_step_norm: f32,
}

/// Append-only audit log of aggregation rounds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<AggregationAuditEntry>,
}

impl AuditLog {
    /// Create a new, empty audit log.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry to the log.
    pub fn push(&mut self, entry: AggregationAuditEntry) {
        self.entries.push(entry);
    }

    /// Get all entries.
    pub fn entries(&self) -> &[AggregationAuditEntry] {
        &self.entries
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&AggregationAuditEntry> {
        self.entries.last()
    }

    /// Number of recorded rounds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every entry, e.g. to ship them to external storage.
    pub fn drain(&mut self) -> Vec<AggregationAuditEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
