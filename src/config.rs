//! Startup configuration
//!
//! A single JSON document, read once and validated before the first round.
//! Every section has defaults so a minimal file only lists the junctions.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigValidationError;
use crate::sim::{JunctionId, VehicleClass};

/// Full configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub simulation: SimulationConfig,
    pub junctions: Vec<JunctionConfig>,
    pub reward: RewardConfig,
    pub vehicle_weights: VehicleWeights,
    pub model: ModelConfig,
    pub ppo: PpoConfig,
    pub federation: FederationConfig,
    pub inference: InferenceConfig,
}

/// A controlled junction and the size of its discrete action space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JunctionConfig {
    pub id: String,
    /// Number of selectable green phases
    pub action_space: usize,
}

/// Which simulator the adapter drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulatorBackend {
    /// Built-in seeded point-queue model
    Builtin(QueueModelConfig),
    /// External bridge process speaking newline-delimited JSON
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for SimulatorBackend {
    fn default() -> Self {
        SimulatorBackend::Builtin(QueueModelConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub backend: SimulatorBackend,
    pub seed: u64,
    /// Simulator seconds per control tick (the green time)
    pub control_interval_secs: u32,
    /// Lost time at the start of an interval that changes phase
    pub yellow_secs: u32,
    /// Ticks per episode (the simulation horizon)
    pub episode_ticks: u64,
    /// Bound on a single simulator step before it is declared failed
    pub step_timeout_ms: u64,
    /// Append the priority-vehicle flag to observations
    pub priority_aware: bool,
    pub queue_norm: f32,
    pub wait_norm: f32,
    pub phase_norm: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            backend: SimulatorBackend::default(),
            seed: 42,
            control_interval_secs: 10,
            yellow_secs: 3,
            episode_ticks: 360,
            step_timeout_ms: 10_000,
            priority_aware: true,
            queue_norm: 20.0,
            wait_norm: 120.0,
            phase_norm: 120.0,
        }
    }
}

/// Parameters of the built-in queue model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueModelConfig {
    /// Default arrivals per second on every approach
    pub arrival_rate: f32,
    /// Per-junction, per-approach arrival rates overriding `arrival_rate`
    pub arrival_rates: BTreeMap<String, Vec<f32>>,
    /// Vehicles discharged per second on a green approach
    pub saturation_flow: f32,
    /// A vehicle stuck longer than this is teleported out
    pub teleport_after_secs: f32,
    /// Relative frequency of each vehicle class among arrivals
    pub class_mix: BTreeMap<VehicleClass, f32>,
    /// Stop generating arrivals after this many simulated seconds
    pub demand_until_secs: Option<f64>,
}

impl Default for QueueModelConfig {
    fn default() -> Self {
        Self {
            arrival_rate: 0.12,
            arrival_rates: BTreeMap::new(),
            saturation_flow: 0.5,
            teleport_after_secs: 300.0,
            class_mix: BTreeMap::from([
                (VehicleClass::Car, 0.80),
                (VehicleClass::Motorcycle, 0.08),
                (VehicleClass::Bus, 0.05),
                (VehicleClass::Truck, 0.06),
                (VehicleClass::Emergency, 0.01),
            ]),
            demand_until_secs: None,
        }
    }
}

/// Reward shaping constants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub queue_weight: f32,
    pub waiting_weight: f32,
    pub pressure_weight: f32,
    pub scale: f32,
    pub gridlock_penalty: f32,
    /// Teleports inside the window that count as gridlock
    pub gridlock_teleport_threshold: u32,
    /// Sliding window length in ticks
    pub gridlock_window: usize,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            queue_weight: 1.0,
            waiting_weight: 0.1,
            pressure_weight: 0.5,
            scale: 0.1,
            gridlock_penalty: 10.0,
            gridlock_teleport_threshold: 3,
            gridlock_window: 5,
        }
    }
}

/// Priority weight per vehicle class; unlisted classes weigh 1.0
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleWeights(pub BTreeMap<VehicleClass, f32>);

impl VehicleWeights {
    pub fn weight(&self, class: VehicleClass) -> f32 {
        self.0.get(&class).copied().unwrap_or(1.0)
    }

    /// Every class weighs 1.0
    pub fn uniform() -> Self {
        Self(BTreeMap::new())
    }
}

impl Default for VehicleWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (VehicleClass::Car, 1.0),
            (VehicleClass::Motorcycle, 0.5),
            (VehicleClass::Bus, 2.0),
            (VehicleClass::Truck, 1.5),
            (VehicleClass::Emergency, 5.0),
        ]))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_sizes: Vec<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![64, 64],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    /// Ticks collected per round (T)
    pub rollout_horizon: usize,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip_epsilon: f32,
    /// Epochs per update (K)
    pub epochs: usize,
    pub minibatch_size: usize,
    pub value_coef: f32,
    pub entropy_coef: f32,
    pub learning_rate: f64,
    pub max_grad_norm: f32,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            rollout_horizon: 64,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            epochs: 4,
            minibatch_size: 32,
            value_coef: 0.5,
            entropy_coef: 0.01,
            learning_rate: 3e-4,
            max_grad_norm: 0.5,
        }
    }
}

/// How client weights are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Each client weighted by its reported sample count
    #[default]
    SampleWeighted,
    Uniform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Round budget (attempted rounds)
    pub rounds: u64,
    pub round_timeout_ms: u64,
    pub aggregation: AggregationStrategy,
    /// Blend factor toward the previous global model
    pub server_momentum: f32,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Also persist each client's latest weights
    pub save_client_models: bool,
    /// Continue from an existing checkpoint
    pub resume: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            rounds: 100,
            round_timeout_ms: 120_000,
            aggregation: AggregationStrategy::default(),
            server_momentum: 0.0,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            save_client_models: false,
            resume: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub max_steps: u64,
    /// Cap on consecutive ticks a priority vehicle may hold a green phase
    pub max_priority_extension_ticks: u32,
    pub log_dir: PathBuf,
    pub log_interval: u64,
    pub fixed_program: FixedProgramConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_steps: 360,
            max_priority_extension_ticks: 3,
            log_dir: PathBuf::from("inference_results"),
            log_interval: 1,
            fixed_program: FixedProgramConfig::default(),
        }
    }
}

/// Static phase timing used by the `fixed` baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedProgramConfig {
    /// Ticks each green phase is held
    pub phase_ticks: u32,
    /// Per-junction hold times, one entry per green phase
    pub per_junction: BTreeMap<String, Vec<u32>>,
}

impl Default for FixedProgramConfig {
    fn default() -> Self {
        Self {
            phase_ticks: 3,
            per_junction: BTreeMap::new(),
        }
    }
}

fn env_override<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse::<T>().ok())
}

impl Config {
    /// Read a config file; does not validate
    pub fn load(path: &Path) -> Result<Self, ConfigValidationError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply `FEDSIGNAL_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(seed) = env_override::<u64>("FEDSIGNAL_SEED") {
            tracing::info!("Seed overridden from environment: {}", seed);
            self.simulation.seed = seed;
        }
        if let Some(rounds) = env_override::<u64>("FEDSIGNAL_ROUNDS") {
            tracing::info!("Round budget overridden from environment: {}", rounds);
            self.federation.rounds = rounds;
        }
        if let Ok(dir) = env::var("FEDSIGNAL_CHECKPOINT_DIR") {
            tracing::info!("Checkpoint dir overridden from environment: {}", dir);
            self.federation.checkpoint_dir = PathBuf::from(dir);
        }
    }

    pub fn junction_ids(&self) -> Vec<JunctionId> {
        self.junctions
            .iter()
            .map(|j| JunctionId::from(j.id.as_str()))
            .collect()
    }

    /// Action-space size keyed by junction
    pub fn action_spaces(&self) -> BTreeMap<JunctionId, usize> {
        self.junctions
            .iter()
            .map(|j| (JunctionId::from(j.id.as_str()), j.action_space))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.junctions.is_empty() {
            return Err(ConfigValidationError::NoJunctions);
        }
        let mut seen = HashSet::new();
        for junction in &self.junctions {
            if !seen.insert(junction.id.as_str()) {
                return Err(ConfigValidationError::DuplicateJunction(junction.id.clone()));
            }
            if junction.action_space == 0 {
                return Err(ConfigValidationError::EmptyActionSpace(junction.id.clone()));
            }
        }

        let sim = &self.simulation;
        if sim.control_interval_secs == 0 {
            return Err(ConfigValidationError::out_of_range(
                "simulation.control_interval_secs",
                "positive",
                0.0,
            ));
        }
        if sim.yellow_secs > sim.control_interval_secs {
            return Err(ConfigValidationError::out_of_range(
                "simulation.yellow_secs",
                "at most control_interval_secs",
                sim.yellow_secs as f64,
            ));
        }
        if sim.episode_ticks == 0 {
            return Err(ConfigValidationError::out_of_range(
                "simulation.episode_ticks",
                "positive",
                0.0,
            ));
        }
        for (field, value) in [
            ("simulation.queue_norm", sim.queue_norm),
            ("simulation.wait_norm", sim.wait_norm),
            ("simulation.phase_norm", sim.phase_norm),
        ] {
            if value <= 0.0 {
                return Err(ConfigValidationError::out_of_range(
                    field,
                    "positive",
                    value as f64,
                ));
            }
        }

        let reward = &self.reward;
        for (field, value) in [
            ("reward.queue_weight", reward.queue_weight),
            ("reward.waiting_weight", reward.waiting_weight),
            ("reward.pressure_weight", reward.pressure_weight),
            ("reward.scale", reward.scale),
            ("reward.gridlock_penalty", reward.gridlock_penalty),
        ] {
            if value < 0.0 {
                return Err(ConfigValidationError::out_of_range(
                    field,
                    "non-negative",
                    value as f64,
                ));
            }
        }
        if reward.gridlock_window == 0 {
            return Err(ConfigValidationError::out_of_range(
                "reward.gridlock_window",
                "positive",
                0.0,
            ));
        }

        if self.model.hidden_sizes.iter().any(|&h| h == 0) {
            return Err(ConfigValidationError::out_of_range(
                "model.hidden_sizes",
                "all positive",
                0.0,
            ));
        }

        let ppo = &self.ppo;
        if ppo.rollout_horizon == 0 {
            return Err(ConfigValidationError::out_of_range(
                "ppo.rollout_horizon",
                "positive",
                0.0,
            ));
        }
        if ppo.epochs == 0 {
            return Err(ConfigValidationError::out_of_range("ppo.epochs", "positive", 0.0));
        }
        if ppo.minibatch_size == 0 {
            return Err(ConfigValidationError::out_of_range(
                "ppo.minibatch_size",
                "positive",
                0.0,
            ));
        }
        for (field, value) in [("ppo.gamma", ppo.gamma), ("ppo.gae_lambda", ppo.gae_lambda)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::out_of_range(
                    field,
                    "within [0, 1]",
                    value as f64,
                ));
            }
        }
        if ppo.clip_epsilon <= 0.0 {
            return Err(ConfigValidationError::out_of_range(
                "ppo.clip_epsilon",
                "positive",
                ppo.clip_epsilon as f64,
            ));
        }
        for (field, value) in [
            ("ppo.value_coef", ppo.value_coef),
            ("ppo.entropy_coef", ppo.entropy_coef),
            ("ppo.max_grad_norm", ppo.max_grad_norm),
        ] {
            if value < 0.0 {
                return Err(ConfigValidationError::out_of_range(
                    field,
                    "non-negative",
                    value as f64,
                ));
            }
        }
        if ppo.learning_rate <= 0.0 {
            return Err(ConfigValidationError::out_of_range(
                "ppo.learning_rate",
                "positive",
                ppo.learning_rate,
            ));
        }

        let fed = &self.federation;
        if fed.rounds == 0 {
            return Err(ConfigValidationError::out_of_range(
                "federation.rounds",
                "positive",
                0.0,
            ));
        }
        if fed.round_timeout_ms == 0 {
            return Err(ConfigValidationError::out_of_range(
                "federation.round_timeout_ms",
                "positive",
                0.0,
            ));
        }
        if !(0.0..1.0).contains(&fed.server_momentum) {
            return Err(ConfigValidationError::out_of_range(
                "federation.server_momentum",
                "within [0, 1)",
                fed.server_momentum as f64,
            ));
        }

        if self.inference.log_interval == 0 {
            return Err(ConfigValidationError::out_of_range(
                "inference.log_interval",
                "positive",
                0.0,
            ));
        }
        if self.inference.fixed_program.phase_ticks == 0 {
            return Err(ConfigValidationError::out_of_range(
                "inference.fixed_program.phase_ticks",
                "positive",
                0.0,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_junctions() -> Config {
        Config {
            junctions: vec![
                JunctionConfig {
                    id: "J1".into(),
                    action_space: 4,
                },
                JunctionConfig {
                    id: "J2".into(),
                    action_space: 3,
                },
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"junctions":[{"id":"J1","action_space":4}]}"#).unwrap();
        assert_eq!(config.ppo.rollout_horizon, 64);
        assert!((config.reward.queue_weight - 1.0).abs() < 1e-6);
        assert_eq!(config.inference.max_priority_extension_ticks, 3);
        assert!(matches!(
            config.simulation.backend,
            SimulatorBackend::Builtin(_)
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_process_backend_parses() {
        let config: Config = serde_json::from_str(
            r#"{"simulation":{"backend":{"kind":"process","command":"sumo-bridge","args":["-c","osm.sumocfg"]}},
                "junctions":[{"id":"J1","action_space":2}]}"#,
        )
        .unwrap();
        match config.simulation.backend {
            SimulatorBackend::Process { command, args } => {
                assert_eq!(command, "sumo-bridge");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn test_empty_junction_list_rejected() {
        assert_eq!(
            Config::default().validate(),
            Err(ConfigValidationError::NoJunctions)
        );
    }

    #[test]
    fn test_duplicate_junction_rejected() {
        let mut config = two_junctions();
        config.junctions[1].id = "J1".into();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateJunction("J1".into()))
        );
    }

    #[test]
    fn test_non_positive_horizon_rejected() {
        let mut config = two_junctions();
        config.ppo.rollout_horizon = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::OutOfRange {
                field: "ppo.rollout_horizon",
                ..
            })
        ));
    }

    #[test]
    fn test_momentum_must_be_below_one() {
        let mut config = two_junctions();
        config.federation.server_momentum = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_action_spaces_by_junction() {
        let config = two_junctions();
        let spaces = config.action_spaces();
        assert_eq!(spaces.len(), 2);
        assert_eq!(spaces[&JunctionId::from("J1")], 4);
        assert_eq!(spaces[&JunctionId::from("J2")], 3);
    }

    #[test]
    fn test_vehicle_weight_fallback() {
        let weights = VehicleWeights::uniform();
        assert!((weights.weight(VehicleClass::Bus) - 1.0).abs() < 1e-6);
        assert!((VehicleWeights::default().weight(VehicleClass::Emergency) - 5.0).abs() < 1e-6);
    }
}
