#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use fedsignal::config::{
    Config, JunctionConfig, ModelConfig, PpoConfig, QueueModelConfig, RewardConfig,
    VehicleWeights,
};
use fedsignal::sim::{
    AdapterSettings, JunctionId, QueueSimulator, SimulationEnvironmentAdapter, SimulationSession,
};

/// Reward is exactly minus the stopped-vehicle count
pub fn queue_only_reward() -> RewardConfig {
    RewardConfig {
        queue_weight: 1.0,
        waiting_weight: 0.0,
        pressure_weight: 0.0,
        scale: 1.0,
        ..RewardConfig::default()
    }
}

pub fn busy_traffic() -> QueueModelConfig {
    QueueModelConfig {
        arrival_rate: 0.4,
        ..QueueModelConfig::default()
    }
}

/// Built-in simulator with two green phases per junction, already reset
pub fn session(ids: &[&str], episode_ticks: u64, reward: RewardConfig) -> SimulationSession {
    let spaces: BTreeMap<JunctionId, usize> =
        ids.iter().map(|id| (JunctionId::from(*id), 2)).collect();
    let sim = QueueSimulator::new(spaces.clone(), busy_traffic(), 2);
    let settings = AdapterSettings {
        seed: 11,
        control_interval_secs: 5,
        episode_ticks,
        priority_aware: true,
        queue_norm: 20.0,
        wait_norm: 120.0,
        phase_norm: 120.0,
        reward,
        vehicle_weights: VehicleWeights::uniform(),
    };
    let mut adapter = SimulationEnvironmentAdapter::new(Box::new(sim), settings, spaces);
    adapter.reset().unwrap();
    SimulationSession::new(adapter)
}

/// Small end-to-end config writing under `dir`
pub fn config(dir: &Path, ids: &[&str]) -> Config {
    let mut config = Config {
        junctions: ids
            .iter()
            .map(|id| JunctionConfig {
                id: id.to_string(),
                action_space: 2,
            })
            .collect(),
        model: ModelConfig {
            hidden_sizes: vec![16],
        },
        ppo: PpoConfig {
            rollout_horizon: 6,
            minibatch_size: 3,
            epochs: 2,
            ..PpoConfig::default()
        },
        ..Config::default()
    };
    config.simulation.backend = fedsignal::config::SimulatorBackend::Builtin(busy_traffic());
    config.simulation.episode_ticks = 20;
    config.simulation.control_interval_secs = 5;
    config.federation.rounds = 2;
    config.federation.round_timeout_ms = 30_000;
    config.federation.checkpoint_dir = dir.join("checkpoints");
    config.federation.log_dir = dir.join("logs");
    config.inference.log_dir = dir.join("inference");
    config.inference.max_steps = 12;
    config
}
