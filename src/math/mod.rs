//! Mathematical primitives for SCAFFOLD-FL.
//!
//! - [`norms`]: L2 norm computations used for round summaries

pub mod norms;

pub use norms::{l2_norm, l2_norm_sq};
