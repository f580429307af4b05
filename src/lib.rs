pub mod config;
pub mod error;
pub mod federated;
pub mod inference;
pub mod rl;
pub mod sim;

use burn::backend::{Autodiff, NdArray};

/// Backend for LocalTrainer updates
pub type TrainingBackend = Autodiff<NdArray>;
/// Backend for greedy control
pub type InferenceBackend = NdArray;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{
    CheckpointError, ClientError, ConfigValidationError, InferenceError, SimulationFailure,
    TrainingError,
};
pub use federated::{CancelToken, FederatedCoordinator, GlobalModel, run_training};
pub use inference::{InferenceMode, ModelSource, run_inference};
pub use rl::{LocalTrainer, PolicyConfig, PolicyValueNet};
pub use sim::{JunctionId, SimulationEnvironmentAdapter, SimulationSession};
