//! # SCAFFOLD-FL: Control-Variate Aggregation for Federated Learning
//!
//! Implements SCAFFOLD (Karimireddy et al., 2020), which cancels client
//! drift on non-IID data with control variates.
//!
//! ## Components
//!
//! - [`ScaffoldAggregator`] - server side: global model `x`, global control variate `c`
//! - [`ScaffoldCoordinator`] - client side: per-step correction and end-of-run update
//! - [`HookRegistry`] - resolves the hooks an aggregator needs for a training framework
//! - [`ParameterVector`] - ordered parameter arrays with elementwise arithmetic
//!
//! ## Round Flow
//!
//! ```rust
//! use ndarray::ArrayD;
//! use scaffold_fl::hooks::TrainableModel;
//! use scaffold_fl::registry::NDARRAY_FRAMEWORK;
//! use scaffold_fl::{HookRegistry, ParameterVector, ScaffoldAggregator, ScaffoldConfig};
//!
//! struct Linear { w: Vec<ArrayD<f32>>, g: Vec<ArrayD<f32>> }
//!
//! impl TrainableModel for Linear {
//!     fn parameters(&self) -> &[ArrayD<f32>] { &self.w }
//!     fn parameters_mut(&mut self) -> &mut [ArrayD<f32>] { &mut self.w }
//!     fn gradient(&self, i: usize) -> Option<&ArrayD<f32>> { self.g.get(i) }
//!     fn learning_rate(&self) -> f32 { 0.1 }
//!     fn num_samples(&self) -> usize { 16 }
//! }
//!
//! let x = ParameterVector::from_shaped(vec![(vec![2], vec![1.0, -1.0])]).unwrap();
//! let mut server = ScaffoldAggregator::with_model(ScaffoldConfig::new(1.0), x).unwrap();
//!
//! let registry = HookRegistry::with_defaults();
//! let mut hooks = registry
//!     .resolve(ScaffoldAggregator::required_hooks(), NDARRAY_FRAMEWORK)
//!     .into_chain();
//!
//! let global = server.snapshot().unwrap();
//! let mut model = Linear {
//!     w: global.model.clone().into_arrays(),
//!     g: vec![ArrayD::from_elem(vec![2], 1.0)],
//! };
//!
//! hooks.on_train_start(&model, &global).unwrap();
//! for _ in 0..4 {
//!     hooks.on_before_optimizer_step(&model).unwrap();
//!     model.w[0].scaled_add(-0.1, &model.g[0]);
//!     hooks.on_after_optimizer_step(&mut model).unwrap();
//! }
//! let update = hooks.on_train_end(&model).unwrap().local_update.unwrap();
//!
//! server.aggregate(&[update]).unwrap();
//! assert_eq!(server.round(), 1);
//! ```

#![deny(missing_docs)]

pub mod aggregators;
pub mod audit;
pub mod error;
pub mod hooks;
pub mod math;
pub mod params;
pub mod registry;
pub mod update;

// Re-exports
pub use aggregators::{ScaffoldAggregator, ScaffoldConfig, UpdateWeighting};
pub use error::ScaffoldError;
pub use hooks::{HookChain, ScaffoldCoordinator, TrainableModel, TrainingHook};
pub use params::{ControlVariate, ParameterVector};
pub use registry::{HookRegistry, HookRequirement};
pub use update::{GlobalStateSnapshot, LocalUpdate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
