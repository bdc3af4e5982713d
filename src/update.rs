//! Round records exchanged between clients and the server.
//!
//! Both types are serde-serializable and index-aligned with the global
//! model's parameter ordering.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::{ControlVariate, ParameterVector};

/// One client's contribution to a round: weight delta, control-variate delta and sample count.
///
/// Created once per completed local run and never modified afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalUpdate {
    delta_y_i: ParameterVector,
    delta_c_i: ParameterVector,
    num_samples: usize,
}

impl LocalUpdate {
    /// Create a new update record.
    pub fn new(delta_y_i: ParameterVector, delta_c_i: ParameterVector, num_samples: usize) -> Self {
        Self {
            delta_y_i,
            delta_c_i,
            num_samples,
        }
    }

    /// `y_i - x`: change in model weights over the local run.
    pub fn delta_y(&self) -> &ParameterVector {
        &self.delta_y_i
    }

    /// `c_i_new - c_i_old`: change in the client's control variate.
    pub fn delta_c(&self) -> &ParameterVector {
        &self.delta_c_i
    }

    /// Number of local training samples behind this update.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Check both deltas against the model's shape sequence.
    pub fn validate_against(&self, model: &ParameterVector) -> Result<()> {
        model.check_compatible(&self.delta_y_i)?;
        model.check_compatible(&self.delta_c_i)
    }
}

/// Deep copy of the server's global state, fetched by clients at round start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalStateSnapshot {
    /// Global model `x`
    pub model: ParameterVector,
    /// Global control variate `c`
    pub control_variate: ControlVariate,
}
