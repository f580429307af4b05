//! Federated averaging of client weight blobs

use thiserror::Error;

use crate::config::AggregationStrategy;
use crate::rl::{WeightBlob, WeightError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("no contributions to aggregate")]
    Empty,
    #[error("contribution {index} does not match the reference shape: {source}")]
    Shape {
        index: usize,
        #[source]
        source: WeightError,
    },
    #[error("aggregate does not match the previous global model: {0}")]
    Previous(#[source] WeightError),
}

/// One client's weights and the experience behind them
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    pub weights: &'a WeightBlob,
    pub samples: usize,
}

impl<'a> Contribution<'a> {
    pub fn new(weights: &'a WeightBlob, samples: usize) -> Self {
        Self { weights, samples }
    }
}

/// Normalized mixing coefficients, one per contribution
///
/// Falls back to uniform when no contribution reports any samples.
pub fn mixing_weights(contributions: &[Contribution<'_>], strategy: AggregationStrategy) -> Vec<f64> {
    let n = contributions.len();
    if n == 0 {
        return Vec::new();
    }
    let total: usize = contributions.iter().map(|c| c.samples).sum();
    match strategy {
        AggregationStrategy::SampleWeighted if total > 0 => contributions
            .iter()
            .map(|c| c.samples as f64 / total as f64)
            .collect(),
        _ => vec![1.0 / n as f64; n],
    }
}

/// FedAvg over structurally identical blobs
///
/// Sums are accumulated in f64 so identical inputs average back to
/// themselves bit for bit.
pub fn fed_avg(
    contributions: &[Contribution<'_>],
    strategy: AggregationStrategy,
) -> Result<WeightBlob, AggregationError> {
    let reference = contributions.first().ok_or(AggregationError::Empty)?.weights;
    for (index, contribution) in contributions.iter().enumerate() {
        contribution
            .weights
            .check_shape(reference)
            .map_err(|source| AggregationError::Shape { index, source })?;
    }

    let coefficients = mixing_weights(contributions, strategy);
    let mut sums: Vec<Vec<f64>> = reference
        .tensors
        .iter()
        .map(|t| vec![0.0; t.values.len()])
        .collect();

    for (contribution, coefficient) in contributions.iter().zip(&coefficients) {
        for (acc, tensor) in sums.iter_mut().zip(&contribution.weights.tensors) {
            for (a, v) in acc.iter_mut().zip(&tensor.values) {
                *a += coefficient * f64::from(*v);
            }
        }
    }

    let mut result = reference.zeros_like();
    for (tensor, acc) in result.tensors.iter_mut().zip(sums) {
        tensor.values = acc.into_iter().map(|v| v as f32).collect();
    }
    Ok(result)
}

/// Server momentum: `(1 - momentum) * aggregate + momentum * previous`
pub fn blend(
    previous: &WeightBlob,
    aggregate: WeightBlob,
    momentum: f32,
) -> Result<WeightBlob, AggregationError> {
    if momentum == 0.0 {
        return Ok(aggregate);
    }
    aggregate
        .check_shape(previous)
        .map_err(AggregationError::Previous)?;
    let mut blended = previous.zeros_like();
    blended.add_scaled(&aggregate, 1.0 - momentum);
    blended.add_scaled(previous, momentum);
    Ok(blended)
}
