mod common;

use std::fs;

use fedsignal::config::Config;
use fedsignal::federated::{CheckpointStore, GlobalModel};
use fedsignal::inference::{InferenceMode, ModelSource, run_inference};
use fedsignal::rl::{PolicyConfig, PolicyValueNet};
use fedsignal::sim::open_session;
use fedsignal::{InferenceBackend, InferenceError};

/// Save a freshly initialised global model matching the config's simulation
fn save_model(config: &Config) {
    let session = open_session(config).unwrap();
    let (obs_size, head) = session
        .with_adapter(|adapter| (adapter.observation_size(), adapter.action_head()))
        .unwrap();
    let policy = PolicyConfig::from_model(obs_size, head, &config.model);
    let net: PolicyValueNet<InferenceBackend> = policy.init(&Default::default());
    let store = CheckpointStore::new(&config.federation.checkpoint_dir);
    store
        .save_global(&GlobalModel::new(5, policy, net.to_blob()))
        .unwrap();
}

#[tokio::test]
async fn test_rl_mode_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), &["A", "B"]);
    save_model(&config);

    let first = run_inference(&config, InferenceMode::Rl, ModelSource::Global)
        .await
        .unwrap();
    let first_log = fs::read_to_string(&first.log_path).unwrap();

    let second = run_inference(&config, InferenceMode::Rl, ModelSource::Global)
        .await
        .unwrap();
    let second_log = fs::read_to_string(&second.log_path).unwrap();

    assert_eq!(first.ticks, config.inference.max_steps);
    assert_eq!(first.actions, second.actions);
    assert_eq!(first_log, second_log);
    assert_eq!(first.junctions, second.junctions);
    assert!(first.log_path.ends_with("inference_rl.csv"));
}

#[tokio::test]
async fn test_fixed_mode_writes_step_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), &["A", "B"]);
    config.inference.fixed_program.phase_ticks = 2;
    config.inference.log_interval = 3;

    let summary = run_inference(&config, InferenceMode::Fixed, ModelSource::Global)
        .await
        .unwrap();
    assert_eq!(summary.actions[0], vec![0, 0]);
    assert_eq!(summary.actions[2], vec![1, 1]);

    let log = fs::read_to_string(&summary.log_path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines[0], "tick,A_queue,A_wait,B_queue,B_wait");
    // every third tick of 12
    assert_eq!(lines.len(), 1 + 4);
    assert!(lines[1].starts_with("3,"));
    assert!(!dir.path().join("inference/inference_fixed.csv.partial").exists());
}

#[tokio::test]
async fn test_session_ends_when_all_junctions_done() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), &["A"]);
    config.simulation.episode_ticks = 4;
    config.inference.max_steps = 50;

    let summary = run_inference(&config, InferenceMode::Fixed, ModelSource::Global)
        .await
        .unwrap();
    assert_eq!(summary.ticks, 4);
}

#[tokio::test]
async fn test_priority_mode_runs_with_junction_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), &["A", "B"]);
    save_model(&config);

    let summary = run_inference(&config, InferenceMode::RlPriority, ModelSource::Junction)
        .await
        .unwrap();
    assert_eq!(summary.ticks, config.inference.max_steps);
    assert!(summary.log_path.ends_with("inference_rl_priority.csv"));
}

#[tokio::test]
async fn test_missing_model_fails_without_touching_logs() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), &["A"]);
    let existing = config.inference.log_dir.join("inference_rl.csv");
    fs::create_dir_all(&config.inference.log_dir).unwrap();
    fs::write(&existing, "tick,A_queue,A_wait\n1,0,0.000\n").unwrap();

    let result = run_inference(&config, InferenceMode::Rl, ModelSource::Global).await;
    assert!(matches!(result, Err(InferenceError::Checkpoint(_))));
    assert_eq!(
        fs::read_to_string(&existing).unwrap(),
        "tick,A_queue,A_wait\n1,0,0.000\n"
    );
}
