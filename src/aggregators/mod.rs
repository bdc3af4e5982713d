//! Control-variate aggregation for federated learning.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`ScaffoldAggregator`] | owns `x` and `c`, applies one round of client updates |
//! | [`ScaffoldConfig`] | `eta_g`, participation scaling and weighting policy |
//!
//! The client half of the protocol lives in [`hooks::scaffold`](crate::hooks::scaffold).

pub mod config;
pub mod scaffold;

pub use config::{ScaffoldConfig, UpdateWeighting};
pub use scaffold::{GlobalState, ScaffoldAggregator};
