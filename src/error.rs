//! Error taxonomy for training and inference
//!
//! Gridlock is not represented here: it is a recoverable episode end and is
//! reported through `StepInfo::gridlock` instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::federated::AggregationError;
use crate::sim::JunctionId;

/// Fatal simulator fault for the current round (training) or session (inference)
#[derive(Debug, Clone, Error)]
pub enum SimulationFailure {
    #[error("failed to start simulator `{command}`: {reason}")]
    Start { command: String, reason: String },
    #[error("simulator exited unexpectedly: {0}")]
    Exited(String),
    #[error("simulator protocol error: {0}")]
    Protocol(String),
    #[error("simulator did not answer within {0} ms")]
    StepTimeout(u64),
    #[error("simulation not started, call reset first")]
    NotStarted,
    #[error("unknown junction `{0}`")]
    UnknownJunction(JunctionId),
    #[error("no action submitted for active junction `{0}`")]
    MissingAction(JunctionId),
    #[error("simulation session lock poisoned")]
    Poisoned,
    #[error("junction `{0}` missed the tick deadline and was removed from the barrier")]
    Evicted(JunctionId),
    #[error("tick barrier closed")]
    BarrierClosed,
}

/// Configuration rejected at startup
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("no junctions configured")]
    NoJunctions,
    #[error("junction `{0}` configured more than once")]
    DuplicateJunction(String),
    #[error("junction `{0}` has an empty action space")]
    EmptyActionSpace(String),
    #[error(
        "junction `{junction}` configured with {configured} actions but the simulator reports {reported} green phases"
    )]
    ActionSpaceMismatch {
        junction: String,
        configured: usize,
        reported: usize,
    },
    #[error("junction `{0}` is not present in the simulated network")]
    UnknownJunction(String),
    #[error("`{field}` must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },
    #[error("failed to read config `{path}`: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

impl ConfigValidationError {
    pub(crate) fn out_of_range(field: &'static str, expected: &'static str, value: f64) -> Self {
        Self::OutOfRange {
            field,
            expected,
            value,
        }
    }
}

/// Model persistence failures
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to write checkpoint `{path}` (after retry): {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read checkpoint `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint `{path}` is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("checkpoint shape does not match the configured model: {0}")]
    ShapeMismatch(String),
}

/// Why a junction client produced no usable contribution this round
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("simulation failure during collection: {0}")]
    Simulation(#[from] SimulationFailure),
    #[error("received global weights that do not fit the local network: {0}")]
    IncompatibleWeights(String),
    #[error("interrupted")]
    Cancelled,
    #[error("rollout produced no experience")]
    EmptyRollout,
}

/// Errors that stop the training process
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error(transparent)]
    Simulation(#[from] SimulationFailure),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("failed to write training log `{path}`: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort an inference session
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error(transparent)]
    Simulation(#[from] SimulationFailure),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("failed to write metric log `{path}`: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
