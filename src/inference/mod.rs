//! Inference sessions: fixed-time baseline and greedy learned control
//!
//! ```text
//! fixed        FixedTimeProgram ─────────────┐
//! rl           GlobalModel ─► argmax ────────┼──► SimulationSession.step ──► inference_<mode>.csv
//! rl_priority  GlobalModel ─► argmax ─► hold ┘
//! ```

pub mod controller;
pub mod fixed;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use controller::{
    DecisionSource, InferenceController, InferenceSettings, InferenceSummary, JunctionSummary,
    PriorityOverride,
};
pub use fixed::FixedTimeProgram;

use crate::InferenceBackend;
use crate::config::Config;
use crate::error::{CheckpointError, InferenceError};
use crate::federated::{CheckpointStore, GlobalModel};
use crate::rl::{PolicyConfig, PolicyValueNet};
use crate::sim::{JunctionId, open_session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    Fixed,
    Rl,
    RlPriority,
}

impl fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InferenceMode::Fixed => "fixed",
            InferenceMode::Rl => "rl",
            InferenceMode::RlPriority => "rl_priority",
        })
    }
}

impl FromStr for InferenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(InferenceMode::Fixed),
            "rl" => Ok(InferenceMode::Rl),
            "rl_priority" | "rl-priority" => Ok(InferenceMode::RlPriority),
            other => Err(format!(
                "unknown mode `{}` (expected fixed, rl or rl_priority)",
                other
            )),
        }
    }
}

/// Which snapshot the learned modes load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    #[default]
    Global,
    /// Per-junction weights saved during training, falling back to global
    Junction,
}

impl FromStr for ModelSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(ModelSource::Global),
            "junction" => Ok(ModelSource::Junction),
            other => Err(format!("unknown model source `{}` (expected global or junction)", other)),
        }
    }
}

fn build_network(
    model: &GlobalModel,
    expected: &PolicyConfig,
) -> Result<PolicyValueNet<InferenceBackend>, CheckpointError> {
    if !model.policy.same_shape(expected) {
        return Err(CheckpointError::ShapeMismatch(format!(
            "checkpoint network has {} inputs and {} actions, simulation needs {} and {}",
            model.policy.obs_size, model.policy.num_actions, expected.obs_size, expected.num_actions
        )));
    }
    let device = Default::default();
    model
        .policy
        .init::<InferenceBackend>(&device)
        .load_blob(&model.weights)
        .map_err(|e| CheckpointError::ShapeMismatch(e.to_string()))
}

/// Load one greedy network per junction
pub fn load_policies(
    store: &CheckpointStore,
    source: ModelSource,
    junctions: &[JunctionId],
    expected: &PolicyConfig,
) -> Result<BTreeMap<JunctionId, PolicyValueNet<InferenceBackend>>, CheckpointError> {
    let global_path = store.global_path();
    let global = store.load_global()?.ok_or_else(|| CheckpointError::Read {
        path: global_path.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, "no trained model, run `train` first"),
    })?;
    tracing::info!(
        "Loaded global model round {} from {} (saved {})",
        global.round,
        global_path.display(),
        global.saved_at
    );
    let global_net = build_network(&global, expected)?;

    let mut policies = BTreeMap::new();
    for junction in junctions {
        let net = match source {
            ModelSource::Global => global_net.clone(),
            ModelSource::Junction => match store.load_junction(junction)? {
                Some(model) => build_network(&model, expected)?,
                None => {
                    tracing::warn!("No saved weights for junction {}, using the global model", junction);
                    global_net.clone()
                }
            },
        };
        policies.insert(junction.clone(), net);
    }
    Ok(policies)
}

/// Validate the config, open the session and run one inference session
pub async fn run_inference(
    config: &Config,
    mode: InferenceMode,
    source: ModelSource,
) -> Result<InferenceSummary, InferenceError> {
    config.validate()?;

    let session = open_session(config)?;
    session.with_adapter(|adapter| adapter.validate_layout())??;
    let (obs_size, action_head) =
        session.with_adapter(|adapter| (adapter.observation_size(), adapter.action_head()))?;
    let action_spaces = config.action_spaces();

    let decisions = match mode {
        InferenceMode::Fixed => DecisionSource::Fixed(FixedTimeProgram::new(
            &config.inference.fixed_program,
            &action_spaces,
        )),
        InferenceMode::Rl | InferenceMode::RlPriority => {
            let store = CheckpointStore::new(&config.federation.checkpoint_dir);
            let expected = PolicyConfig::from_model(obs_size, action_head, &config.model);
            DecisionSource::Learned(load_policies(
                &store,
                source,
                &config.junction_ids(),
                &expected,
            )?)
        }
    };

    let settings = InferenceSettings {
        mode,
        max_steps: config.inference.max_steps,
        max_priority_extension_ticks: config.inference.max_priority_extension_ticks,
        log_dir: config.inference.log_dir.clone(),
        log_interval: config.inference.log_interval,
    };
    let mut controller = InferenceController::new(session.clone(), settings, decisions, action_spaces);
    let result = controller.run().await;

    if let Err(e) = session.with_adapter(|adapter| adapter.close()) {
        tracing::warn!("Simulator not closed cleanly: {}", e);
    }
    result
}
