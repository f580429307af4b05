//! Synchronous federated rounds
//!
//! ```text
//! round r:  broadcast global ──► spawn one task per client (tick barrier shared)
//!           collect reports until the round deadline, abort stragglers
//!           shape check ──► FedAvg (+ server momentum) ──► persist ──► log
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};

use crate::config::{AggregationStrategy, Config};
use crate::error::{ClientError, TrainingError};
use crate::sim::{BarrierReport, JunctionId, JunctionLink, SimulationSession, TickBarrier};

use super::aggregate::{Contribution, blend, fed_avg};
use super::checkpoint::{CheckpointStore, GlobalModel};
use super::client::{CancelToken, ClientUpdate, FederatedClient};
use super::round_log::RoundLog;

/// Why a junction is missing from a round's aggregate
#[derive(Debug, Clone, Error)]
pub enum DropoutReason {
    #[error("no report before the round deadline")]
    TimedOut,
    #[error("{0}")]
    Failed(ClientError),
    #[error("client task panicked: {0}")]
    Panicked(String),
    #[error("weights rejected: {0}")]
    ShapeMismatch(String),
}

#[derive(Debug, Clone)]
pub struct Dropout {
    pub junction: JunctionId,
    pub reason: DropoutReason,
}

impl Dropout {
    pub fn new(junction: JunctionId, reason: DropoutReason) -> Self {
        Self { junction, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// A new GlobalModel was produced
    Aggregated,
    /// No usable report; the global model is unchanged
    Abandoned,
    /// Interrupted before every surviving client reported
    Discarded,
}

/// Outcome of one attempted round
#[derive(Debug, Clone)]
pub struct TrainingRound {
    /// 1-based index within this run's budget
    pub attempt: u64,
    /// Global round number after this attempt
    pub round: u64,
    pub status: RoundStatus,
    pub participants: Vec<JunctionId>,
    pub dropouts: Vec<Dropout>,
    pub mean_reward: f32,
    pub mean_loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub samples: usize,
    /// Shared simulation ticks advanced during collection
    pub ticks: u64,
}

impl TrainingRound {
    fn new(attempt: u64, round: u64, status: RoundStatus, report: &BarrierReport) -> Self {
        Self {
            attempt,
            round,
            status,
            participants: Vec::new(),
            dropouts: Vec::new(),
            mean_reward: 0.0,
            mean_loss: 0.0,
            policy_loss: 0.0,
            value_loss: 0.0,
            entropy: 0.0,
            samples: 0,
            ticks: report.ticks,
        }
    }

    fn summarize(&mut self, updates: &[ClientUpdate]) {
        self.participants = updates.iter().map(|u| u.junction.clone()).collect();
        if updates.is_empty() {
            return;
        }
        let n = updates.len() as f32;
        let mean = |f: fn(&ClientUpdate) -> f32| updates.iter().map(f).sum::<f32>() / n;
        self.mean_reward = mean(|u| u.stats.mean_reward);
        self.mean_loss = mean(|u| u.stats.mean_loss);
        self.policy_loss = mean(|u| u.stats.policy_loss);
        self.value_loss = mean(|u| u.stats.value_loss);
        self.entropy = mean(|u| u.stats.entropy);
        self.samples = updates.iter().map(|u| u.stats.samples).sum();
    }
}

/// Totals over a training run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingSummary {
    pub attempted: u64,
    pub aggregated: u64,
    pub abandoned: u64,
    pub discarded: u64,
    /// Round number of the last persisted GlobalModel
    pub final_round: u64,
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Attempted rounds in this run
    pub rounds: u64,
    pub round_timeout: Duration,
    /// How long a tick may wait on its slowest junction
    pub straggler_timeout: Duration,
    pub aggregation: AggregationStrategy,
    pub server_momentum: f32,
    pub save_client_models: bool,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rounds: config.federation.rounds,
            round_timeout: Duration::from_millis(config.federation.round_timeout_ms),
            straggler_timeout: Duration::from_millis(config.simulation.step_timeout_ms),
            aggregation: config.federation.aggregation,
            server_momentum: config.federation.server_momentum,
            save_client_models: config.federation.save_client_models,
        }
    }
}

type TaskResult = Result<ClientUpdate, ClientError>;

/// Drives rounds over a fixed set of junction clients
pub struct FederatedCoordinator<C: FederatedClient> {
    session: SimulationSession,
    clients: Vec<(JunctionId, Arc<Mutex<C>>)>,
    global: GlobalModel,
    store: CheckpointStore,
    log: RoundLog,
    settings: CoordinatorSettings,
    cancel: CancelToken,
    history: Vec<TrainingRound>,
}

impl<C: FederatedClient> FederatedCoordinator<C> {
    pub fn new(
        session: SimulationSession,
        clients: Vec<C>,
        global: GlobalModel,
        store: CheckpointStore,
        log: RoundLog,
        settings: CoordinatorSettings,
        cancel: CancelToken,
    ) -> Self {
        let clients = clients
            .into_iter()
            .map(|client| (client.junction().clone(), Arc::new(Mutex::new(client))))
            .collect();
        Self {
            session,
            clients,
            global,
            store,
            log,
            settings,
            cancel,
            history: Vec::new(),
        }
    }

    pub fn global(&self) -> &GlobalModel {
        &self.global
    }

    pub fn history(&self) -> &[TrainingRound] {
        &self.history
    }

    /// Run until the budget is spent or the cancel token fires. The last
    /// aggregated model is persisted before returning.
    pub async fn run(&mut self) -> Result<TrainingSummary, TrainingError> {
        tracing::info!(
            "Starting federated training: {} clients, {} rounds, global model at round {}",
            self.clients.len(),
            self.settings.rounds,
            self.global.round
        );
        self.store.save_global(&self.global)?;

        let mut summary = TrainingSummary::default();
        for attempt in 1..=self.settings.rounds {
            if self.cancel.is_cancelled() {
                tracing::info!("Interrupted before round attempt {}", attempt);
                summary.interrupted = true;
                break;
            }

            let record = self.run_round(attempt).await?;
            summary.attempted += 1;
            let status = record.status;
            self.history.push(record);
            match status {
                RoundStatus::Aggregated => summary.aggregated += 1,
                RoundStatus::Abandoned => summary.abandoned += 1,
                RoundStatus::Discarded => {
                    summary.discarded += 1;
                    summary.interrupted = true;
                    break;
                }
            }
        }

        self.store.save_global(&self.global)?;
        summary.final_round = self.global.round;
        tracing::info!(
            "Training finished: {} attempted, {} aggregated, {} abandoned, {} discarded, global round {}",
            summary.attempted,
            summary.aggregated,
            summary.abandoned,
            summary.discarded,
            summary.final_round
        );
        Ok(summary)
    }

    /// One broadcast/collect/aggregate cycle
    pub async fn run_round(&mut self, attempt: u64) -> Result<TrainingRound, TrainingError> {
        let target = self.global.round + 1;
        tracing::debug!("Round {} (attempt {}): broadcasting global weights", target, attempt);

        let global = Arc::new(self.global.weights.clone());
        let junctions = self.clients.iter().map(|(junction, _)| junction.clone());
        let (barrier, links) =
            TickBarrier::new(self.session.clone(), junctions, self.settings.straggler_timeout);
        let barrier = tokio::spawn(barrier.run());
        let mut links: BTreeMap<JunctionId, JunctionLink> = links
            .into_iter()
            .map(|link| (link.junction().clone(), link))
            .collect();

        let deadline = Instant::now() + self.settings.round_timeout;
        let mut tasks = Vec::with_capacity(self.clients.len());
        for (junction, client) in &self.clients {
            let Some(link) = links.remove(junction) else {
                continue;
            };
            let client = Arc::clone(client);
            let global = Arc::clone(&global);
            let cancel = self.cancel.clone();
            let handle = tokio::spawn(async move {
                let mut client = client.lock().await;
                client.run_round(target, global, link, cancel).await
            });
            tasks.push((junction.clone(), handle));
        }

        let mut updates = Vec::with_capacity(tasks.len());
        let mut dropouts = Vec::new();
        for (junction, mut handle) in tasks {
            let outcome: Result<Result<TaskResult, _>, _> = timeout_at(deadline, &mut handle).await;
            match outcome {
                // a report that finished past the deadline still counts as late
                Ok(Ok(Ok(_))) if Instant::now() > deadline => {
                    dropouts.push(Dropout::new(junction, DropoutReason::TimedOut))
                }
                Ok(Ok(Ok(update))) => updates.push(update),
                Ok(Ok(Err(e))) => dropouts.push(Dropout::new(junction, DropoutReason::Failed(e))),
                Ok(Err(e)) => {
                    dropouts.push(Dropout::new(junction, DropoutReason::Panicked(e.to_string())))
                }
                Err(_) => {
                    handle.abort();
                    dropouts.push(Dropout::new(junction, DropoutReason::TimedOut));
                }
            }
        }

        let report = match barrier.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Round {}: tick barrier task failed: {}", target, e);
                BarrierReport::default()
            }
        };
        if let Some(failure) = &report.failure {
            tracing::error!("Round {}: simulation failure during collection: {}", target, failure);
        }

        let interrupted = dropouts
            .iter()
            .any(|d| matches!(d.reason, DropoutReason::Failed(ClientError::Cancelled)));

        let mut usable = Vec::with_capacity(updates.len());
        for update in updates {
            match update.weights.check_shape(&self.global.weights) {
                Ok(()) => usable.push(update),
                Err(e) => dropouts.push(Dropout::new(
                    update.junction,
                    DropoutReason::ShapeMismatch(e.to_string()),
                )),
            }
        }

        for dropout in &dropouts {
            tracing::warn!(
                "Round {}: junction {} dropped out: {}",
                target,
                dropout.junction,
                dropout.reason
            );
        }

        let record = if interrupted {
            tracing::warn!(
                "Round {} discarded: interrupted before every client reported",
                target
            );
            let mut record =
                TrainingRound::new(attempt, self.global.round, RoundStatus::Discarded, &report);
            record.summarize(&usable);
            record.dropouts = dropouts;
            record
        } else if usable.is_empty() {
            tracing::warn!(
                "Round {} abandoned: no client reported, global model stays at round {}",
                target,
                self.global.round
            );
            let mut record =
                TrainingRound::new(attempt, self.global.round, RoundStatus::Abandoned, &report);
            record.dropouts = dropouts;
            record
        } else {
            self.aggregate(&usable)?;
            let mut record =
                TrainingRound::new(attempt, self.global.round, RoundStatus::Aggregated, &report);
            record.summarize(&usable);
            record.dropouts = dropouts;
            tracing::info!(
                "Round {}: reward={:.3}, loss={:.4}, entropy={:.4}, samples={}, participants={}, dropouts={}",
                record.round,
                record.mean_reward,
                record.mean_loss,
                record.entropy,
                record.samples,
                record.participants.len(),
                record.dropouts.len()
            );
            record
        };

        self.log.append(&record)?;
        Ok(record)
    }

    /// FedAvg the usable reports into the next GlobalModel and persist it
    fn aggregate(&mut self, updates: &[ClientUpdate]) -> Result<(), TrainingError> {
        let contributions: Vec<Contribution<'_>> = updates
            .iter()
            .map(|u| Contribution::new(&u.weights, u.stats.samples))
            .collect();
        let averaged = fed_avg(&contributions, self.settings.aggregation)?;
        let weights = blend(&self.global.weights, averaged, self.settings.server_momentum)?;
        let next = self.global.next(weights);

        self.store.save_global(&next)?;
        self.global = next;

        if self.settings.save_client_models {
            for update in updates {
                let snapshot = GlobalModel::new(
                    self.global.round,
                    self.global.policy.clone(),
                    update.weights.clone(),
                );
                if let Err(e) = self.store.save_junction(&update.junction, &snapshot) {
                    tracing::warn!(
                        "Round {}: could not save junction {} weights: {}",
                        self.global.round,
                        update.junction,
                        e
                    );
                }
            }
        }
        Ok(())
    }
}
