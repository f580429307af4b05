//! Shape-tagged weight blobs exchanged between clients and the coordinator

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("expected {expected} parameter tensors, got {found}")]
    TensorCount { expected: usize, found: usize },
    #[error("parameter tensor {index} has shape {found:?}, expected {expected:?}")]
    Shape {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("parameter tensor {index} holds {values} values for shape {shape:?}")]
    Malformed {
        index: usize,
        shape: Vec<usize>,
        values: usize,
    },
}

/// One parameter tensor, flattened row-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    fn expected_len(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Full parameter set of a network, in a fixed layer order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightBlob {
    pub tensors: Vec<ParamTensor>,
}

impl WeightBlob {
    pub fn new(tensors: Vec<ParamTensor>) -> Self {
        Self { tensors }
    }

    pub fn shapes(&self) -> Vec<&[usize]> {
        self.tensors.iter().map(|t| t.shape.as_slice()).collect()
    }

    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(|t| t.values.len()).sum()
    }

    /// Every tensor holds exactly as many values as its shape implies
    pub fn validate(&self) -> Result<(), WeightError> {
        for (index, tensor) in self.tensors.iter().enumerate() {
            if tensor.values.len() != tensor.expected_len() {
                return Err(WeightError::Malformed {
                    index,
                    shape: tensor.shape.clone(),
                    values: tensor.values.len(),
                });
            }
        }
        Ok(())
    }

    /// Structural equality with `reference`
    pub fn check_shape(&self, reference: &WeightBlob) -> Result<(), WeightError> {
        if self.tensors.len() != reference.tensors.len() {
            return Err(WeightError::TensorCount {
                expected: reference.tensors.len(),
                found: self.tensors.len(),
            });
        }
        for (index, (ours, theirs)) in self.tensors.iter().zip(&reference.tensors).enumerate() {
            if ours.shape != theirs.shape {
                return Err(WeightError::Shape {
                    index,
                    expected: theirs.shape.clone(),
                    found: ours.shape.clone(),
                });
            }
        }
        self.validate()
    }

    /// Same shapes, all values zero
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|t| ParamTensor::new(t.shape.clone(), vec![0.0; t.values.len()]))
                .collect(),
        }
    }

    /// `self += factor * other`; shapes must already have been checked
    pub fn add_scaled(&mut self, other: &WeightBlob, factor: f32) {
        for (ours, theirs) in self.tensors.iter_mut().zip(&other.tensors) {
            for (a, b) in ours.values.iter_mut().zip(&theirs.values) {
                *a += factor * b;
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.tensors
            .iter()
            .all(|t| t.values.iter().all(|v| v.is_finite()))
    }
}
