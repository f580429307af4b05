//! Per-junction PPO using Burn
//!
//! ```text
//! Observation (padded features + action mask)
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PolicyValueNet                                             │
//! │  - shared trunk → actor logits (masked) + critic value      │
//! │  - export/import as a shape-tagged WeightBlob               │
//! └─────────────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  LocalTrainer                                               │
//! │  - COLLECTING: T ticks through the junction's barrier link  │
//! │  - UPDATING: GAE, K epochs of clipped-surrogate minibatches │
//! │  - SYNCED: weights + rollout stats back to the coordinator  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod loss;
pub mod metrics;
pub mod policy;
pub mod trainer;
pub mod weights;

pub use buffer::{ExperienceStep, RolloutBuffer};
pub use loss::{LossWeights, clipped_surrogate, ppo_loss};
pub use metrics::{MovingAverage, RolloutStats, TrainingMetrics, UpdateStats};
pub use policy::{ActionChoice, PolicyConfig, PolicyValueNet};
pub use trainer::{LocalTrainer, TrainerPhase, adam_optimizer};
pub use weights::{ParamTensor, WeightBlob, WeightError};
