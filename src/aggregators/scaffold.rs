//! SCAFFOLD server-side aggregation.
//!
//! Keeps the global model `x` and the global control variate `c`. One call
//! to [`ScaffoldAggregator::aggregate`] consumes a complete round:
//!
//! - `x <- x + eta_g * sum(w_i * delta_y_i)`
//! - `c <- c + scaling_factor * sum(delta_c_i)`
//!
//! Every update is validated before anything is accumulated, so a rejected
//! round leaves the global state untouched.

use std::collections::BTreeSet;

use log::debug;
use ndarray::ArrayD;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::config::{total_samples, ScaffoldConfig};
use crate::audit::{AggregationAuditEntry, AuditLog};
use crate::error::{Result, ScaffoldError};
use crate::params::{ControlVariate, ParameterVector};
use crate::registry::HookRequirement;
use crate::update::{GlobalStateSnapshot, LocalUpdate};

/// Canonical global state owned by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    model: ParameterVector,
    control_variate: ControlVariate,
    eta_g: f32,
}

impl GlobalState {
    /// Global model `x`.
    pub fn model(&self) -> &ParameterVector {
        &self.model
    }

    /// Global control variate `c`.
    pub fn control_variate(&self) -> &ControlVariate {
        &self.control_variate
    }

    /// Global step size `eta_g`.
    pub fn global_lr(&self) -> f32 {
        self.eta_g
    }
}

/// SCAFFOLD aggregator.
///
/// # Example
///
/// ```rust
/// use scaffold_fl::aggregators::{ScaffoldAggregator, ScaffoldConfig};
/// use scaffold_fl::params::ParameterVector;
/// use scaffold_fl::update::LocalUpdate;
///
/// let model = ParameterVector::from_shaped(vec![(vec![2], vec![1.0, 2.0])]).unwrap();
/// let mut agg = ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), model).unwrap();
///
/// let delta = ParameterVector::from_shaped(vec![(vec![2], vec![0.5, -0.5])]).unwrap();
/// let update = LocalUpdate::new(delta.clone(), delta, 100);
///
/// let x = agg.aggregate(&[update]).unwrap();
/// assert_eq!(x[0].as_slice().unwrap(), &[1.5f32, 1.5]);
/// ```
#[derive(Clone, Debug)]
pub struct ScaffoldAggregator {
    config: ScaffoldConfig,
    state: Option<GlobalState>,
    round: usize,
    audit: AuditLog,
}

impl ScaffoldAggregator {
    /// Create an aggregator; the global model is installed later with
    /// [`set_initial_model`](Self::set_initial_model).
    pub fn new(config: ScaffoldConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: None,
            round: 0,
            audit: AuditLog::new(),
        })
    }

    /// Create an aggregator and install its initial model.
    pub fn with_model(config: ScaffoldConfig, model: ParameterVector) -> Result<Self> {
        let mut agg = Self::new(config)?;
        agg.set_initial_model(model)?;
        Ok(agg)
    }

    /// Capability tags clients must resolve to take part in SCAFFOLD rounds.
    pub fn required_hooks() -> BTreeSet<HookRequirement> {
        BTreeSet::from([HookRequirement::Scaffold])
    }

    /// Install the starting global model and a zero control variate.
    ///
    /// May only be called once.
    pub fn set_initial_model(&mut self, model: ParameterVector) -> Result<()> {
        if self.state.is_some() {
            return Err(ScaffoldError::AlreadyInitialized);
        }
        debug!(
            "scaffold global state initialized: params={} elements={}",
            model.len(),
            model.num_elements()
        );
        self.state = Some(GlobalState {
            control_variate: model.zeros_like(),
            model,
            eta_g: self.config.global_lr,
        });
        Ok(())
    }

    /// Whether `set_initial_model` has been called.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Active configuration.
    pub fn config(&self) -> &ScaffoldConfig {
        &self.config
    }

    /// Full global state.
    pub fn state(&self) -> Result<&GlobalState> {
        self.state.as_ref().ok_or(ScaffoldError::Uninitialized)
    }

    /// Current global model `x`.
    pub fn model(&self) -> Result<&ParameterVector> {
        self.state().map(|s| &s.model)
    }

    /// Current global control variate `c`.
    pub fn control_variate(&self) -> Result<&ControlVariate> {
        self.state().map(|s| &s.control_variate)
    }

    /// Deep copy of `x` and `c` for clients starting a round.
    pub fn snapshot(&self) -> Result<GlobalStateSnapshot> {
        let state = self.state()?;
        Ok(GlobalStateSnapshot {
            model: state.model.clone(),
            control_variate: state.control_variate.clone(),
        })
    }

    /// Number of completed rounds.
    pub fn round(&self) -> usize {
        self.round
    }

    /// Per-round audit records.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Take every audit record collected so far, leaving the log empty.
    ///
    /// Long-running servers call this periodically to bound memory.
    /// [`round`](Self::round) keeps counting.
    pub fn drain_audit_log(&mut self) -> Vec<AggregationAuditEntry> {
        self.audit.drain()
    }

    /// Apply one complete round of client updates and return the new global model.
    ///
    /// # Errors
    ///
    /// - [`ScaffoldError::Uninitialized`] before `set_initial_model`
    /// - [`ScaffoldError::NoUpdates`] for an empty round
    /// - [`ScaffoldError::LengthMismatch`] / [`ScaffoldError::ShapeMismatch`]
    ///   if any delta disagrees with the model's shapes
    /// - [`ScaffoldError::ParticipationExceeded`] / [`ScaffoldError::ZeroSamples`]
    ///   from the configured policies
    /// - [`ScaffoldError::SampleCountOverflow`] if the reported sample counts
    ///   do not sum within `usize`
    ///
    /// The global state is only modified when every check passes.
    pub fn aggregate(&mut self, updates: &[LocalUpdate]) -> Result<&ParameterVector> {
        let state = self.state.as_mut().ok_or(ScaffoldError::Uninitialized)?;
        if updates.is_empty() {
            return Err(ScaffoldError::NoUpdates);
        }
        for update in updates {
            update.validate_against(&state.model)?;
        }
        let total_samples = total_samples(updates)?;
        let scaling_factor = self.config.scaling_factor(updates.len())?;
        let weights = self.config.update_weights(updates)?;

        let delta_y: Vec<&ParameterVector> = updates.iter().map(|u| u.delta_y()).collect();
        let delta_c: Vec<&ParameterVector> = updates.iter().map(|u| u.delta_c()).collect();
        let model_step = accumulate(&state.model, &delta_y, &weights).scale(state.eta_g);
        let control_step = accumulate(&state.model, &delta_c, &vec![1.0; updates.len()])
            .scale(scaling_factor);

        state.model.scaled_add(1.0, &model_step)?;
        state.control_variate.scaled_add(1.0, &control_step)?;

        let entry = AggregationAuditEntry {
            round: self.round,
            n_updates: updates.len(),
            total_samples,
            scaling_factor,
            weighting: self.config.weighting,
            model_step_norm: model_step.l2_norm(),
            control_step_norm: control_step.l2_norm(),
        };
        debug!(
            "scaffold round {} aggregated: updates={} samples={} scaling={} |dx|={:.6} |dc|={:.6}",
            entry.round,
            entry.n_updates,
            entry.total_samples,
            entry.scaling_factor,
            entry.model_step_norm,
            entry.control_step_norm
        );
        self.audit.push(entry);
        self.round += 1;

        Ok(&state.model)
    }
}

/// Weighted elementwise sum of `deltas`, computed per parameter index in parallel.
fn accumulate(
    model: &ParameterVector,
    deltas: &[&ParameterVector],
    weights: &[f32],
) -> ParameterVector {
    let arrays: Vec<ArrayD<f32>> = (0..model.len())
        .into_par_iter()
        .map(|index| {
            deltas
                .iter()
                .zip(weights)
                .fold(ArrayD::zeros(model[index].raw_dim()), |mut acc, (delta, &w)| {
                    acc.scaled_add(w, &delta[index]);
                    acc
                })
        })
        .collect();
    ParameterVector::new(arrays)
}
