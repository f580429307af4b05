//! Federated training across junction clients
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  FederatedCoordinator                                         │
//! │  - broadcast GlobalModel weights                              │
//! │  - one task per LocalTrainer, joined per tick by TickBarrier  │
//! │  - dropouts on timeout/failure, FedAvg over the rest          │
//! │  - CheckpointStore + RoundLog at every round boundary         │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregate;
pub mod checkpoint;
pub mod client;
pub mod coordinator;
pub mod round_log;

pub use aggregate::{AggregationError, Contribution, blend, fed_avg, mixing_weights};
pub use checkpoint::{CheckpointStore, GlobalModel};
pub use client::{CancelToken, ClientUpdate, FederatedClient};
pub use coordinator::{
    CoordinatorSettings, Dropout, DropoutReason, FederatedCoordinator, RoundStatus,
    TrainingRound, TrainingSummary,
};
pub use round_log::{RoundLog, RoundRecord};

use crate::TrainingBackend;
use crate::config::Config;
use crate::error::TrainingError;
use crate::rl::{LocalTrainer, PolicyConfig, adam_optimizer};
use crate::sim::open_session;

/// Per-junction sampling seed
fn client_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add(1_000).wrapping_add(index as u64 * 7_919)
}

/// Build the session, one LocalTrainer per configured junction and the
/// coordinator, then train until the budget is spent or `cancel` fires
pub async fn run_training(
    config: &Config,
    cancel: CancelToken,
) -> Result<TrainingSummary, TrainingError> {
    config.validate()?;

    let session = open_session(config)?;
    session.with_adapter(|adapter| adapter.validate_layout())??;
    let (obs_size, action_head) =
        session.with_adapter(|adapter| (adapter.observation_size(), adapter.action_head()))?;

    let policy = PolicyConfig::from_model(obs_size, action_head, &config.model);
    tracing::info!(
        "Policy network: {} inputs, {:?} hidden, {} actions",
        policy.obs_size,
        policy.hidden_sizes,
        policy.num_actions
    );

    let device = Default::default();
    let fresh = policy.init::<TrainingBackend>(&device).to_blob();
    let store = CheckpointStore::new(&config.federation.checkpoint_dir);
    let global = store.resume_or_init(policy.clone(), fresh, config.federation.resume)?;

    let trainers: Vec<_> = config
        .junction_ids()
        .into_iter()
        .enumerate()
        .map(|(index, junction)| {
            LocalTrainer::new(
                junction,
                &policy,
                adam_optimizer::<TrainingBackend>(&config.ppo),
                config.ppo.clone(),
                client_seed(config.simulation.seed, index),
                device.clone(),
            )
        })
        .collect();

    let mut coordinator = FederatedCoordinator::new(
        session.clone(),
        trainers,
        global,
        store,
        RoundLog::open(&config.federation.log_dir),
        CoordinatorSettings::from_config(config),
        cancel,
    );
    let result = coordinator.run().await;

    if let Err(e) = session.with_adapter(|adapter| adapter.close()) {
        tracing::warn!("Simulator not closed cleanly: {}", e);
    }
    result
}
