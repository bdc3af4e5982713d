//! Server-side configuration for [`ScaffoldAggregator`](super::ScaffoldAggregator).

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScaffoldError};
use crate::update::LocalUpdate;

/// How client weight deltas are combined before the global step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateWeighting {
    /// Plain sum of `delta_y_i`
    #[default]
    Uniform,
    /// Each `delta_y_i` scaled by `m * n_i / sum(n)`, where `m` is the number of updates.
    ///
    /// Equal sample counts reduce to [`UpdateWeighting::Uniform`].
    BySamples,
}

/// SCAFFOLD server configuration.
///
/// ```rust
/// use scaffold_fl::aggregators::{ScaffoldConfig, UpdateWeighting};
///
/// let config: ScaffoldConfig =
///     serde_json::from_str(r#"{ "global_lr": 0.5, "total_clients": 8 }"#).unwrap();
/// assert_eq!(config.weighting, UpdateWeighting::Uniform);
/// assert!((config.scaling_factor(2).unwrap() - 0.25).abs() < 1e-6);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaffoldConfig {
    /// Global step size `eta_g`
    pub global_lr: f32,
    /// Size of the full client population; `None` assumes full participation
    #[serde(default)]
    pub total_clients: Option<usize>,
    /// Weighting policy for `delta_y_i`
    #[serde(default)]
    pub weighting: UpdateWeighting,
}

impl ScaffoldConfig {
    /// Full participation, uniform weighting.
    pub fn new(global_lr: f32) -> Self {
        Self {
            global_lr,
            total_clients: None,
            weighting: UpdateWeighting::Uniform,
        }
    }

    /// Scale the control-variate update by `participating / total_clients`.
    pub fn with_total_clients(mut self, total_clients: usize) -> Self {
        self.total_clients = Some(total_clients);
        self
    }

    /// Set the `delta_y_i` weighting policy.
    pub fn with_weighting(mut self, weighting: UpdateWeighting) -> Self {
        self.weighting = weighting;
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.global_lr.is_finite() || self.global_lr <= 0.0 {
            return Err(ScaffoldError::InvalidConfig(format!(
                "global_lr must be finite and positive, got {}",
                self.global_lr
            )));
        }
        if self.total_clients == Some(0) {
            return Err(ScaffoldError::InvalidConfig(
                "total_clients must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fraction of the client population that reported this round.
    pub fn scaling_factor(&self, participating: usize) -> Result<f32> {
        match self.total_clients {
            None => Ok(1.0),
            Some(total) if participating > total => Err(ScaffoldError::ParticipationExceeded {
                participating,
                total,
            }),
            Some(total) => Ok(participating as f32 / total as f32),
        }
    }

    /// Per-update multipliers for `delta_y_i`.
    pub fn update_weights(&self, updates: &[LocalUpdate]) -> Result<Vec<f32>> {
        match self.weighting {
            UpdateWeighting::Uniform => Ok(vec![1.0; updates.len()]),
            UpdateWeighting::BySamples => {
                let total = total_samples(updates)?;
                if total == 0 {
                    return Err(ScaffoldError::ZeroSamples);
                }
                let m = updates.len() as f32;
                Ok(updates
                    .iter()
                    .map(|u| m * u.num_samples() as f32 / total as f32)
                    .collect())
            }
        }
    }
}

/// Sum of `num_samples` over `updates`.
///
/// Sample counts arrive over the wire, so the sum is checked instead of
/// wrapping.
pub fn total_samples(updates: &[LocalUpdate]) -> Result<usize> {
    updates
        .iter()
        .try_fold(0usize, |acc, u| acc.checked_add(u.num_samples()))
        .ok_or(ScaffoldError::SampleCountOverflow {
            n_updates: updates.len(),
        })
}
