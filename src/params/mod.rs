//! Control-variate store: ordered parameter arrays with elementwise arithmetic.
//!
//! A [`ParameterVector`] holds one `ArrayD<f32>` per model parameter tensor,
//! index-aligned with the global model. Every binary operation validates
//! that both operands have the same shape sequence before touching any data,
//! so a failed call never leaves a partially updated vector behind.

use std::ops::Index;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScaffoldError};
use crate::math::norms::l2_norm;

/// A control variate is a parameter-shaped vector owned by the server or by one client.
pub type ControlVariate = ParameterVector;

/// Ordered sequence of numeric arrays, one per model parameter tensor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector {
    arrays: Vec<ArrayD<f32>>,
}

impl ParameterVector {
    /// Wrap an ordered list of parameter arrays.
    pub fn new(arrays: Vec<ArrayD<f32>>) -> Self {
        Self { arrays }
    }

    /// Build from `(shape, row-major values)` pairs.
    ///
    /// Fails with [`ScaffoldError::ShapeError`] when a value count does not
    /// match its shape.
    pub fn from_shaped(parts: Vec<(Vec<usize>, Vec<f32>)>) -> Result<Self> {
        let arrays = parts
            .into_iter()
            .map(|(shape, values)| ArrayD::from_shape_vec(IxDyn(&shape), values))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { arrays })
    }

    /// Copy a slice of arrays into a new vector.
    pub fn from_arrays(arrays: &[ArrayD<f32>]) -> Self {
        Self {
            arrays: arrays.to_vec(),
        }
    }

    /// All-zero vector with the same shape sequence as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros_for(&self.arrays)
    }

    /// All-zero vector shaped like the given arrays.
    pub fn zeros_for(arrays: &[ArrayD<f32>]) -> Self {
        Self {
            arrays: arrays.iter().map(|a| ArrayD::zeros(a.raw_dim())).collect(),
        }
    }

    /// Number of parameter arrays.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// Whether the vector holds no arrays.
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Total number of scalar elements across all arrays.
    pub fn num_elements(&self) -> usize {
        self.arrays.iter().map(|a| a.len()).sum()
    }

    /// Borrow the parameter arrays.
    pub fn arrays(&self) -> &[ArrayD<f32>] {
        &self.arrays
    }

    /// Consume into the parameter arrays.
    pub fn into_arrays(self) -> Vec<ArrayD<f32>> {
        self.arrays
    }

    /// Get the array at `index`.
    pub fn get(&self, index: usize) -> Option<&ArrayD<f32>> {
        self.arrays.get(index)
    }

    /// Iterate over the parameter arrays.
    pub fn iter(&self) -> impl Iterator<Item = &ArrayD<f32>> {
        self.arrays.iter()
    }

    /// Shape of every array, in order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.arrays.iter().map(|a| a.shape().to_vec()).collect()
    }

    /// Check that `other` has exactly the same shape sequence as `self`.
    pub fn check_compatible(&self, other: &ParameterVector) -> Result<()> {
        self.check_arrays(&other.arrays)
    }

    /// Check that `arrays` has exactly the same shape sequence as `self`.
    pub fn check_arrays(&self, arrays: &[ArrayD<f32>]) -> Result<()> {
        if arrays.len() != self.arrays.len() {
            return Err(ScaffoldError::LengthMismatch {
                expected: self.arrays.len(),
                actual: arrays.len(),
            });
        }
        for (index, (expected, actual)) in self.arrays.iter().zip(arrays).enumerate() {
            if expected.shape() != actual.shape() {
                return Err(ScaffoldError::ShapeMismatch {
                    index,
                    expected: expected.shape().to_vec(),
                    actual: actual.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Elementwise `self + other`.
    pub fn add(&self, other: &ParameterVector) -> Result<Self> {
        self.check_compatible(other)?;
        Ok(self.zip_map(other, |a, b| a + b))
    }

    /// Elementwise `self - other`.
    pub fn sub(&self, other: &ParameterVector) -> Result<Self> {
        self.check_compatible(other)?;
        Ok(self.zip_map(other, |a, b| a - b))
    }

    /// Multiply every element by `factor`.
    pub fn scale(&self, factor: f32) -> Self {
        Self {
            arrays: self.arrays.iter().map(|a| a * factor).collect(),
        }
    }

    /// In-place `self += alpha * other`.
    pub fn scaled_add(&mut self, alpha: f32, other: &ParameterVector) -> Result<()> {
        self.check_compatible(other)?;
        for (dst, src) in self.arrays.iter_mut().zip(&other.arrays) {
            dst.scaled_add(alpha, src);
        }
        Ok(())
    }

    /// L2 norm over every element of every array.
    pub fn l2_norm(&self) -> f32 {
        l2_norm(self.arrays.iter().flat_map(|a| a.iter()))
    }

    fn zip_map(&self, other: &ParameterVector, f: impl Fn(f32, f32) -> f32) -> Self {
        let arrays = self
            .arrays
            .iter()
            .zip(&other.arrays)
            .map(|(a, b)| {
                let mut out = a.clone();
                out.zip_mut_with(b, |x, &y| *x = f(*x, y));
                out
            })
            .collect();
        Self { arrays }
    }
}

impl From<Vec<ArrayD<f32>>> for ParameterVector {
    fn from(arrays: Vec<ArrayD<f32>>) -> Self {
        Self::new(arrays)
    }
}

impl Index<usize> for ParameterVector {
    type Output = ArrayD<f32>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.arrays[index]
    }
}
