//! Norm computations over flat sequences of `f32`.
//!
//! Parameter arrays are not guaranteed to be contiguous, so these take any
//! iterator of values rather than a slice.

/// Compute the L2 (Euclidean) norm of a sequence of values.
pub fn l2_norm<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    l2_norm_sq(values).sqrt()
}

/// Compute the squared L2 norm of a sequence of values (avoids sqrt).
pub fn l2_norm_sq<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    values.into_iter().map(|x| x * x).sum()
}
