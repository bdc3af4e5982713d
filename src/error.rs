//! Error types for SCAFFOLD-FL

use thiserror::Error;

use crate::hooks::Phase;
use crate::registry::HookRequirement;

/// All possible errors in SCAFFOLD-FL
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScaffoldError {
    /// No updates were provided for aggregation
    #[error("No local updates provided for aggregation")]
    NoUpdates,

    /// A parameter vector has a different number of arrays than the model
    #[error("Parameter count mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Number of parameter arrays in the reference model
        expected: usize,
        /// Number of parameter arrays received
        actual: usize,
    },

    /// A parameter array has a different shape than the model's array at the same index
    #[error("Shape mismatch at parameter {index}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter index
        index: usize,
        /// Shape in the reference model
        expected: Vec<usize>,
        /// Shape received
        actual: Vec<usize>,
    },

    /// `aggregate()` was called before `set_initial_model()`
    #[error("Global state is not initialized; call set_initial_model first")]
    Uninitialized,

    /// `set_initial_model()` was called twice
    #[error("Global state is already initialized")]
    AlreadyInitialized,

    /// The run ended without a single optimizer step
    #[error("Local run finished with zero optimizer steps")]
    ZeroLocalSteps,

    /// The last recorded learning rate cannot be used as a divisor
    #[error("Invalid local learning rate: {0}")]
    InvalidLearningRate(f32),

    /// A hook is already registered for this (requirement, framework) pair
    #[error("Hook for requirement '{requirement}' and framework '{framework}' already registered")]
    RegistrationConflict {
        /// Capability tag
        requirement: HookRequirement,
        /// Normalized framework identifier
        framework: String,
    },

    /// A coordinator phase method was called out of order
    #[error("Cannot run {operation} while coordinator is {phase:?}")]
    InvalidPhase {
        /// The rejected operation
        operation: &'static str,
        /// Phase the coordinator was in
        phase: Phase,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// More updates than the configured client population
    #[error("Participation exceeded: {participating} updates for {total} total clients")]
    ParticipationExceeded {
        /// Updates received this round
        participating: usize,
        /// Configured client population
        total: usize,
    },

    /// Sample-weighted aggregation with no samples reported
    #[error("Sample-weighted aggregation requires at least one reported sample")]
    ZeroSamples,

    /// Sum of `num_samples` over a round does not fit in `usize`
    #[error("Sample count overflow while summing {n_updates} updates")]
    SampleCountOverflow {
        /// Updates in the round
        n_updates: usize,
    },

    /// Array shape error
    #[error("Array shape error: {0}")]
    ShapeError(String),
}

impl From<ndarray::ShapeError> for ScaffoldError {
    fn from(e: ndarray::ShapeError) -> Self {
        ScaffoldError::ShapeError(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScaffoldError>;
