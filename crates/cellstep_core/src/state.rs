use serde::{Deserialize, Serialize};
use std::ops::Index;
use thiserror::Error;

/// Returned when a host buffer does not match the fixed state length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("state dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Continuous state of one entity.
///
/// The length is fixed when the vector is built and never changes; index
/// order is the order the right-hand side expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    values: Vec<f64>,
}

impl StateVector {
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            values: values.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Overwrites the contents from a host buffer of the same length.
    pub fn load(&mut self, source: &[f64]) -> Result<(), DimensionMismatch> {
        self.check_len(source.len())?;
        self.values.copy_from_slice(source);
        Ok(())
    }

    /// Copies the contents out to a host buffer of the same length.
    pub fn store(&self, target: &mut [f64]) -> Result<(), DimensionMismatch> {
        self.check_len(target.len())?;
        target.copy_from_slice(&self.values);
        Ok(())
    }

    fn check_len(&self, actual: usize) -> Result<(), DimensionMismatch> {
        if actual != self.values.len() {
            return Err(DimensionMismatch {
                expected: self.values.len(),
                actual,
            });
        }
        Ok(())
    }
}

impl From<Vec<f64>> for StateVector {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl AsRef<[f64]> for StateVector {
    fn as_ref(&self) -> &[f64] {
        &self.values
    }
}

impl Index<usize> for StateVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}
