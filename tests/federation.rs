mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use fedsignal::error::ClientError;
use fedsignal::federated::{
    CancelToken, CheckpointStore, ClientUpdate, CoordinatorSettings, DropoutReason,
    FederatedClient, FederatedCoordinator, GlobalModel, RoundLog, RoundStatus, run_training,
};
use fedsignal::config::AggregationStrategy;
use fedsignal::rl::{ParamTensor, PolicyConfig, RolloutStats, WeightBlob};
use fedsignal::sim::{JunctionId, JunctionLink};

/// Plays a few ticks and reports a scalar weight, or stalls forever
struct ScriptedClient {
    junction: JunctionId,
    value: f32,
    stall: bool,
}

impl FederatedClient for ScriptedClient {
    fn junction(&self) -> &JunctionId {
        &self.junction
    }

    async fn run_round(
        &mut self,
        _round: u64,
        _global: Arc<WeightBlob>,
        link: JunctionLink,
        _cancel: CancelToken,
    ) -> Result<ClientUpdate, ClientError> {
        if self.stall {
            // holds its link without ever submitting
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        for _ in 0..3 {
            link.submit(1).await?;
        }
        Ok(ClientUpdate::new(
            self.junction.clone(),
            WeightBlob::new(vec![ParamTensor::new(vec![1], vec![self.value])]),
            RolloutStats {
                samples: 3,
                mean_reward: -1.0,
                ..RolloutStats::default()
            },
        ))
    }
}

/// Reports a scalar weight; fires the cancel token during `interrupt_round`
struct InterruptingClient {
    junction: JunctionId,
    value: f32,
    interrupt_round: Option<u64>,
}

impl InterruptingClient {
    fn new(id: &str, value: f32, interrupt_round: Option<u64>) -> Self {
        Self {
            junction: JunctionId::from(id),
            value,
            interrupt_round,
        }
    }
}

impl FederatedClient for InterruptingClient {
    fn junction(&self) -> &JunctionId {
        &self.junction
    }

    async fn run_round(
        &mut self,
        round: u64,
        _global: Arc<WeightBlob>,
        link: JunctionLink,
        cancel: CancelToken,
    ) -> Result<ClientUpdate, ClientError> {
        for tick in 0..3 {
            link.submit(0).await?;
            if tick == 0 && self.interrupt_round == Some(round) {
                cancel.cancel();
            }
        }
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        Ok(ClientUpdate::new(
            self.junction.clone(),
            WeightBlob::new(vec![ParamTensor::new(vec![1], vec![self.value])]),
            RolloutStats {
                samples: 3,
                ..RolloutStats::default()
            },
        ))
    }
}

fn scalar_model() -> GlobalModel {
    GlobalModel::new(
        0,
        PolicyConfig::new(1, 1),
        WeightBlob::new(vec![ParamTensor::new(vec![1], vec![0.0])]),
    )
}

fn scalar_settings(rounds: u64) -> CoordinatorSettings {
    CoordinatorSettings {
        rounds,
        round_timeout: Duration::from_secs(5),
        straggler_timeout: Duration::from_secs(1),
        aggregation: AggregationStrategy::SampleWeighted,
        server_momentum: 0.0,
        save_client_models: false,
    }
}

#[tokio::test]
async fn test_client_missing_round_deadline_is_excluded() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    let clients = vec![
        ScriptedClient {
            junction: JunctionId::from("A"),
            value: 1.0,
            stall: false,
        },
        ScriptedClient {
            junction: JunctionId::from("B"),
            value: 3.0,
            stall: false,
        },
        ScriptedClient {
            junction: JunctionId::from("C"),
            value: 100.0,
            stall: true,
        },
    ];
    let initial = GlobalModel::new(
        0,
        PolicyConfig::new(1, 1),
        WeightBlob::new(vec![ParamTensor::new(vec![1], vec![0.0])]),
    );
    let settings = CoordinatorSettings {
        rounds: 1,
        round_timeout: Duration::from_millis(800),
        straggler_timeout: Duration::from_millis(100),
        aggregation: AggregationStrategy::SampleWeighted,
        server_momentum: 0.0,
        save_client_models: false,
    };
    let mut coordinator = FederatedCoordinator::new(
        common::session(&["A", "B", "C"], 50, common::queue_only_reward()),
        clients,
        initial,
        store.clone(),
        RoundLog::open(dir.path()),
        settings,
        CancelToken::new(),
    );

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.aggregated, 1);

    let round = &coordinator.history()[0];
    assert_eq!(round.status, RoundStatus::Aggregated);
    assert_eq!(
        round.participants,
        vec![JunctionId::from("A"), JunctionId::from("B")]
    );
    assert_eq!(round.dropouts.len(), 1);
    assert_eq!(round.dropouts[0].junction, JunctionId::from("C"));
    assert!(matches!(
        round.dropouts[0].reason,
        DropoutReason::TimedOut | DropoutReason::Failed(_)
    ));
    // the remaining clients advanced the shared clock without the straggler
    assert_eq!(round.ticks, 3);

    let saved = store.load_global().unwrap().unwrap();
    assert_eq!(saved.round, 1);
    assert!((saved.weights.tensors[0].values[0] - 2.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_local_trainers_train_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), &["N", "E", "S"]);

    let summary = run_training(&config, CancelToken::new()).await.unwrap();
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.aggregated, 2);
    assert_eq!(summary.final_round, 2);

    let store = CheckpointStore::new(&config.federation.checkpoint_dir);
    let saved = store.load_global().unwrap().unwrap();
    assert_eq!(saved.round, 2);
    assert!(saved.weights.is_finite());

    let csv = std::fs::read_to_string(config.federation.log_dir.join("training_log.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("1,"));
    assert!(lines[1].ends_with(",18,3,0"), "got {}", lines[1]);
}

#[tokio::test]
async fn test_training_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), &["N", "E"]);
    config.federation.rounds = 1;

    run_training(&config, CancelToken::new()).await.unwrap();
    let summary = run_training(&config, CancelToken::new()).await.unwrap();
    assert_eq!(summary.final_round, 2);

    config.federation.resume = false;
    let summary = run_training(&config, CancelToken::new()).await.unwrap();
    assert_eq!(summary.final_round, 1);
}

#[tokio::test]
async fn test_interrupt_keeps_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(dir.path(), &["N"]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let summary = run_training(&config, cancel).await.unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.attempted, 0);

    let store = CheckpointStore::new(&config.federation.checkpoint_dir);
    assert_eq!(store.load_global().unwrap().unwrap().round, 0);
}

#[tokio::test]
async fn test_interrupt_mid_round_discards_it_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    let cancel = CancelToken::new();
    let mut coordinator = FederatedCoordinator::new(
        common::session(&["A", "B"], 50, common::queue_only_reward()),
        vec![
            InterruptingClient::new("A", 1.0, Some(2)),
            InterruptingClient::new("B", 3.0, None),
        ],
        scalar_model(),
        store.clone(),
        RoundLog::open(dir.path().join("logs")),
        scalar_settings(5),
        cancel.clone(),
    );

    let summary = coordinator.run().await.unwrap();
    assert!(cancel.is_cancelled());
    assert!(summary.interrupted);
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.aggregated, 1);
    assert_eq!(summary.discarded, 1);
    assert_eq!(summary.final_round, 1);

    let history = coordinator.history();
    assert_eq!(history[0].status, RoundStatus::Aggregated);
    assert_eq!(history[1].status, RoundStatus::Discarded);
    assert_eq!(history[1].round, 1);

    let saved = store.load_global().unwrap().unwrap();
    assert_eq!(saved.round, 1);
    assert!((saved.weights.tensors[0].values[0] - 2.0).abs() < 1e-6);

    let csv = std::fs::read_to_string(dir.path().join("logs/training_log.csv")).unwrap();
    assert_eq!(csv.lines().count(), 2);

    // a new run picks up the last aggregated model
    let resumed = store
        .resume_or_init(PolicyConfig::new(1, 1), scalar_model().weights, true)
        .unwrap();
    assert_eq!(resumed.round, 1);
    let mut coordinator = FederatedCoordinator::new(
        common::session(&["A", "B"], 50, common::queue_only_reward()),
        vec![
            InterruptingClient::new("A", 1.0, None),
            InterruptingClient::new("B", 3.0, None),
        ],
        resumed,
        store.clone(),
        RoundLog::open(dir.path().join("logs")),
        scalar_settings(1),
        CancelToken::new(),
    );
    let summary = coordinator.run().await.unwrap();
    assert_eq!(coordinator.history()[0].round, 2);
    assert_eq!(summary.final_round, 2);
    assert_eq!(store.load_global().unwrap().unwrap().round, 2);
}

#[tokio::test]
async fn test_slow_local_update_is_cut_off_at_round_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path(), &["N"]);
    config.federation.rounds = 1;
    config.federation.round_timeout_ms = 150;
    config.model.hidden_sizes = vec![64, 64];
    config.ppo.epochs = 20_000;

    let started = Instant::now();
    let summary = run_training(&config, CancelToken::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(5), "round took {:?}", elapsed);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.aggregated, 0);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.final_round, 0);

    let log = RoundLog::open(&config.federation.log_dir);
    let record = &log.records()[0];
    assert_eq!(record.status, RoundStatus::Abandoned);
    assert_eq!(record.dropouts[0].junction, "N");
    assert_eq!(record.dropouts[0].reason, DropoutReason::TimedOut.to_string());
}
