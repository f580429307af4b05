//! Per-junction PPO client

use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::grad_clipping::GradientClippingConfig;
use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::PpoConfig;
use crate::error::ClientError;
use crate::federated::{CancelToken, ClientUpdate, FederatedClient};
use crate::sim::{JunctionId, JunctionLink};

use super::buffer::{ExperienceStep, RolloutBuffer, normalize};
use super::loss::{LossWeights, ppo_loss};
use super::metrics::{RolloutStats, TrainingMetrics, UpdateStats};
use super::policy::{PolicyConfig, PolicyValueNet};
use super::weights::WeightBlob;

/// `COLLECTING → UPDATING → SYNCED → COLLECTING …`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Collecting,
    Updating,
    Synced,
}

/// Adam with gradient-norm clipping, as configured for PPO
pub fn adam_optimizer<B: AutodiffBackend>(
    ppo: &PpoConfig,
) -> impl Optimizer<PolicyValueNet<B>, B> + Send + use<B> {
    let clipping =
        (ppo.max_grad_norm > 0.0).then(|| GradientClippingConfig::Norm(ppo.max_grad_norm));
    AdamConfig::new().with_grad_clipping(clipping).init()
}

/// Tensors for one minibatch
struct Batch<B: Backend> {
    obs: Tensor<B, 2>,
    masks: Tensor<B, 2>,
    actions: Tensor<B, 1, Int>,
    old_log_probs: Tensor<B, 1>,
}

fn batch_tensors<B: Backend>(steps: &[&ExperienceStep], device: &B::Device) -> Batch<B> {
    let batch_size = steps.len();
    let obs_size = steps.first().map(|s| s.observation.len()).unwrap_or(0);
    let num_actions = steps.first().map(|s| s.mask.len()).unwrap_or(0);

    let obs: Vec<f32> = steps.iter().flat_map(|s| s.observation.iter().copied()).collect();
    let masks: Vec<f32> = steps.iter().flat_map(|s| s.mask.iter().copied()).collect();
    let actions: Vec<i64> = steps.iter().map(|s| s.action as i64).collect();
    let old_log_probs: Vec<f32> = steps.iter().map(|s| s.log_prob).collect();

    Batch {
        obs: Tensor::<B, 1>::from_floats(obs.as_slice(), device).reshape([batch_size, obs_size]),
        masks: Tensor::<B, 1>::from_floats(masks.as_slice(), device)
            .reshape([batch_size, num_actions]),
        actions: Tensor::<B, 1, Int>::from_ints(actions.as_slice(), device),
        old_log_probs: Tensor::<B, 1>::from_floats(old_log_probs.as_slice(), device),
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// Junction agent: owns its network, optimizer state and experience buffer
pub struct LocalTrainer<B: AutodiffBackend, O> {
    junction: JunctionId,
    model: PolicyValueNet<B>,
    optimizer: O,
    ppo: PpoConfig,
    device: B::Device,
    rng: StdRng,
    buffer: RolloutBuffer,
    phase: TrainerPhase,
    gridlocks: usize,
    metrics: TrainingMetrics,
}

impl<B, O> LocalTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PolicyValueNet<B>, B>,
{
    pub fn new(
        junction: JunctionId,
        policy: &PolicyConfig,
        optimizer: O,
        ppo: PpoConfig,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            junction,
            model: policy.init(&device),
            optimizer,
            ppo,
            device,
            rng: StdRng::seed_from_u64(seed),
            buffer: RolloutBuffer::new(),
            phase: TrainerPhase::Synced,
            gridlocks: 0,
            metrics: TrainingMetrics::default(),
        }
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn model(&self) -> &PolicyValueNet<B> {
        &self.model
    }

    pub fn buffer(&self) -> &RolloutBuffer {
        &self.buffer
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// Replace local weights with the broadcast global weights
    pub fn load_global(&mut self, global: &WeightBlob) -> Result<(), ClientError> {
        self.model = self
            .model
            .clone()
            .load_blob(global)
            .map_err(|e| ClientError::IncompatibleWeights(e.to_string()))?;
        Ok(())
    }

    /// Run the current policy for `horizon` shared ticks. Returns the
    /// bootstrap value of the final observation.
    pub async fn collect(
        &mut self,
        link: &JunctionLink,
        horizon: usize,
    ) -> Result<f32, ClientError> {
        self.phase = TrainerPhase::Collecting;
        self.buffer.clear();
        self.gridlocks = 0;

        let policy = self.model.valid();
        let mut observation = link.observe().await?;
        let mut last_done = false;

        for _ in 0..horizon {
            let choice = policy.sample_action(&observation, &mut self.rng);
            let step = link.submit(choice.action).await?;

            if step.info.gridlock {
                self.gridlocks += 1;
            }
            self.buffer.push(ExperienceStep {
                observation: observation.features,
                mask: observation.mask,
                action: choice.action,
                log_prob: choice.log_prob,
                reward: step.reward,
                value: choice.value,
                done: step.done,
                tick: step.info.tick,
            });

            last_done = step.done;
            observation = step.observation;
        }

        Ok(if last_done { 0.0 } else { policy.value(&observation) })
    }

    /// GAE, advantage normalization, then the PPO epochs
    pub async fn update(&mut self, last_value: f32) -> UpdateStats {
        let (returns, advantages) = self.buffer.compute_returns_and_advantages(
            last_value,
            self.ppo.gamma,
            self.ppo.gae_lambda,
        );
        let advantages = normalize(&advantages);
        self.optimize(&advantages, &returns).await
    }

    /// K epochs of shuffled minibatch steps over the buffered rollout.
    /// Yields after every step so a round deadline can abort it.
    pub async fn optimize(&mut self, advantages: &[f32], returns: &[f32]) -> UpdateStats {
        self.phase = TrainerPhase::Updating;
        let mut stats = UpdateStats::default();
        let n = self.buffer.len();
        if n == 0 {
            return stats;
        }

        let weights = LossWeights {
            clip_epsilon: self.ppo.clip_epsilon,
            value_coef: self.ppo.value_coef,
            entropy_coef: self.ppo.entropy_coef,
        };
        let mut indices: Vec<usize> = (0..n).collect();
        let minibatch_size = self.ppo.minibatch_size.max(1);

        for _ in 0..self.ppo.epochs {
            indices.shuffle(&mut self.rng);

            for start in (0..n).step_by(minibatch_size) {
                let end = (start + minibatch_size).min(n);
                let (total, policy, value, entropy) =
                    self.minibatch_step(&indices[start..end], advantages, returns, weights);
                stats.record(total, policy, value, entropy);
                tokio::task::yield_now().await;
            }
        }

        stats.finish()
    }

    /// One Adam step; returns (total, policy, value, entropy) losses
    fn minibatch_step(
        &mut self,
        batch_indices: &[usize],
        advantages: &[f32],
        returns: &[f32],
        weights: LossWeights,
    ) -> (f32, f32, f32, f32) {
        let steps: Vec<&ExperienceStep> =
            batch_indices.iter().map(|&i| &self.buffer.steps()[i]).collect();
        let batch = batch_tensors::<B>(&steps, &self.device);

        let batch_advantages: Vec<f32> = batch_indices.iter().map(|&i| advantages[i]).collect();
        let batch_returns: Vec<f32> = batch_indices.iter().map(|&i| returns[i]).collect();
        let advantages_tensor =
            Tensor::<B, 1>::from_floats(batch_advantages.as_slice(), &self.device);
        let returns_tensor = Tensor::<B, 1>::from_floats(batch_returns.as_slice(), &self.device);

        let (new_log_probs, entropy, values) =
            self.model
                .evaluate_actions(batch.obs, batch.masks, batch.actions);
        let loss = ppo_loss(
            new_log_probs,
            batch.old_log_probs,
            advantages_tensor,
            values,
            returns_tensor,
            entropy,
            weights,
        );

        let total = scalar(loss.total.clone());
        let grads = loss.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.ppo.learning_rate, self.model.clone(), grads);

        (
            total,
            scalar(loss.policy),
            scalar(loss.value),
            scalar(loss.entropy),
        )
    }

    /// Log-probability of every buffered action under the current policy
    pub fn taken_log_probs(&self) -> Vec<f32> {
        let steps: Vec<&ExperienceStep> = self.buffer.steps().iter().collect();
        if steps.is_empty() {
            return Vec::new();
        }
        let policy = self.model.valid();
        let batch = batch_tensors::<B::InnerBackend>(&steps, &self.device);
        let (log_probs, _, _) = policy.evaluate_actions(batch.obs, batch.masks, batch.actions);
        log_probs.into_data().iter::<f32>().collect()
    }

    pub fn weights(&self) -> WeightBlob {
        self.model.to_blob()
    }

    fn rollout_stats(&self, update: &UpdateStats) -> RolloutStats {
        RolloutStats {
            samples: self.buffer.len(),
            mean_reward: self.buffer.mean_reward(),
            mean_loss: update.total_loss,
            policy_loss: update.policy_loss,
            value_loss: update.value_loss,
            entropy: update.entropy,
            episodes_ended: self.buffer.episodes_ended(),
            gridlocks: self.gridlocks,
        }
    }
}

impl<B, O> FederatedClient for LocalTrainer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<PolicyValueNet<B>, B> + 'static,
{
    fn junction(&self) -> &JunctionId {
        &self.junction
    }

    async fn run_round(
        &mut self,
        round: u64,
        global: Arc<WeightBlob>,
        link: JunctionLink,
        cancel: CancelToken,
    ) -> Result<ClientUpdate, ClientError> {
        self.load_global(&global)?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let last_value = self.collect(&link, self.ppo.rollout_horizon).await?;
        // leave the tick barrier before the (slow) update
        drop(link);

        if self.buffer.is_empty() {
            return Err(ClientError::EmptyRollout);
        }
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let update = self.update(last_value).await;
        let stats = self.rollout_stats(&update);
        self.phase = TrainerPhase::Synced;
        self.metrics.record_round(&stats);
        self.buffer.clear();

        tracing::debug!(
            "Round {} junction {}: reward={:.3} (avg {:.3}), policy={:.4}, value={:.4}, entropy={:.4}, samples={}, {:.1} samples/s",
            round,
            self.junction,
            stats.mean_reward,
            self.metrics.rewards.average(),
            stats.policy_loss,
            stats.value_loss,
            stats.entropy,
            stats.samples,
            self.metrics.samples_per_second()
        );

        Ok(ClientUpdate::new(
            self.junction.clone(),
            self.model.to_blob(),
            stats,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueModelConfig, RewardConfig, VehicleWeights};
    use crate::sim::{
        AdapterSettings, QueueSimulator, SimulationEnvironmentAdapter, SimulationSession,
        TickBarrier,
    };
    use burn::backend::{Autodiff, NdArray};
    use std::collections::BTreeMap;
    use std::time::Duration;

    type TestBackend = Autodiff<NdArray>;

    fn session() -> SimulationSession {
        let spaces = BTreeMap::from([(JunctionId::from("J1"), 2)]);
        let sim = QueueSimulator::new(spaces.clone(), QueueModelConfig::default(), 0);
        let settings = AdapterSettings {
            seed: 1,
            control_interval_secs: 5,
            episode_ticks: 3,
            priority_aware: true,
            queue_norm: 20.0,
            wait_norm: 120.0,
            phase_norm: 120.0,
            reward: RewardConfig::default(),
            vehicle_weights: VehicleWeights::default(),
        };
        let mut adapter = SimulationEnvironmentAdapter::new(Box::new(sim), settings, spaces);
        adapter.reset().unwrap();
        SimulationSession::new(adapter)
    }

    fn trainer(ppo: PpoConfig) -> LocalTrainer<TestBackend, impl Optimizer<PolicyValueNet<TestBackend>, TestBackend>> {
        // 2 approaches: 4 + elapsed + waiting + priority flag
        let policy = PolicyConfig::new(7, 2).with_hidden_sizes(vec![16]);
        LocalTrainer::new(
            JunctionId::from("J1"),
            &policy,
            adam_optimizer::<TestBackend>(&ppo),
            ppo,
            9,
            Default::default(),
        )
    }

    #[tokio::test]
    async fn test_round_moves_through_phases() {
        let ppo = PpoConfig {
            rollout_horizon: 8,
            minibatch_size: 4,
            epochs: 2,
            ..PpoConfig::default()
        };
        let mut trainer = trainer(ppo);
        assert_eq!(trainer.phase(), TrainerPhase::Synced);
        let global = Arc::new(trainer.weights());

        let (barrier, mut links) =
            TickBarrier::new(session(), [JunctionId::from("J1")], Duration::from_secs(5));
        let barrier = tokio::spawn(barrier.run());

        let update = trainer
            .run_round(1, global.clone(), links.remove(0), CancelToken::new())
            .await
            .unwrap();
        let report = barrier.await.unwrap();

        assert_eq!(trainer.phase(), TrainerPhase::Synced);
        assert_eq!(update.stats.samples, 8);
        // horizon 3 ticks per episode
        assert_eq!(update.stats.episodes_ended, 2);
        assert_eq!(report.episodes, 2);
        assert!(update.weights.check_shape(&global).is_ok());
        assert_ne!(update.weights, *global, "update changed the weights");
        assert!(trainer.buffer().is_empty(), "experience discarded after update");
    }

    #[tokio::test]
    async fn test_cancelled_before_collection() {
        let mut trainer = trainer(PpoConfig::default());
        let global = Arc::new(trainer.weights());
        let (barrier, mut links) =
            TickBarrier::new(session(), [JunctionId::from("J1")], Duration::from_secs(5));
        let barrier = tokio::spawn(barrier.run());

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = trainer.run_round(1, global, links.remove(0), cancel).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(barrier.await.unwrap().ticks, 0);
    }

    #[test]
    fn test_incompatible_global_rejected() {
        let mut trainer = trainer(PpoConfig::default());
        let other: PolicyValueNet<TestBackend> = PolicyConfig::new(7, 3)
            .with_hidden_sizes(vec![16])
            .init(&Default::default());
        assert!(matches!(
            trainer.load_global(&other.to_blob()),
            Err(ClientError::IncompatibleWeights(_))
        ));
    }
}
