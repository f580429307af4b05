//! Metrics for local PPO training

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Moving average calculator
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<f32>,
    window_size: usize,
    sum: f32,
}

impl MovingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() >= self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Averages over the minibatch steps of one update
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateStats {
    pub total_loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub updates: usize,
}

impl UpdateStats {
    pub fn record(&mut self, total: f32, policy: f32, value: f32, entropy: f32) {
        self.total_loss += total;
        self.policy_loss += policy;
        self.value_loss += value;
        self.entropy += entropy;
        self.updates += 1;
    }

    /// Turn the running sums into means
    pub fn finish(mut self) -> Self {
        if self.updates > 0 {
            let n = self.updates as f32;
            self.total_loss /= n;
            self.policy_loss /= n;
            self.value_loss /= n;
            self.entropy /= n;
        }
        self
    }
}

/// What a client reports alongside its weights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutStats {
    pub samples: usize,
    pub mean_reward: f32,
    pub mean_loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub episodes_ended: usize,
    pub gridlocks: usize,
}

/// Per-junction training metrics tracker
#[derive(Debug)]
pub struct TrainingMetrics {
    pub rewards: MovingAverage,
    pub policy_loss: MovingAverage,
    pub value_loss: MovingAverage,
    pub entropy: MovingAverage,
    pub rounds: usize,
    pub total_samples: usize,
    start_time: Instant,
}

impl TrainingMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            rewards: MovingAverage::new(window_size),
            policy_loss: MovingAverage::new(window_size),
            value_loss: MovingAverage::new(window_size),
            entropy: MovingAverage::new(window_size),
            rounds: 0,
            total_samples: 0,
            start_time: Instant::now(),
        }
    }

    pub fn record_round(&mut self, stats: &RolloutStats) {
        self.rewards.push(stats.mean_reward);
        self.policy_loss.push(stats.policy_loss);
        self.value_loss.push(stats.value_loss);
        self.entropy.push(stats.entropy);
        self.rounds += 1;
        self.total_samples += stats.samples;
    }

    /// Samples collected per wall-clock second
    pub fn samples_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_samples as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average() {
        let mut avg = MovingAverage::new(3);

        avg.push(1.0);
        assert!((avg.average() - 1.0).abs() < 1e-6);

        avg.push(2.0);
        assert!((avg.average() - 1.5).abs() < 1e-6);

        avg.push(3.0);
        assert!((avg.average() - 2.0).abs() < 1e-6);

        avg.push(4.0); // Pushes out 1.0
        assert!((avg.average() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_update_stats_means() {
        let mut stats = UpdateStats::default();
        stats.record(1.0, 0.5, 2.0, 0.1);
        stats.record(3.0, 1.5, 4.0, 0.3);
        let stats = stats.finish();
        assert_eq!(stats.updates, 2);
        assert!((stats.total_loss - 2.0).abs() < 1e-6);
        assert!((stats.entropy - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_training_metrics_accumulate() {
        let mut metrics = TrainingMetrics::new(2);
        let stats = RolloutStats {
            samples: 64,
            mean_reward: -1.0,
            ..RolloutStats::default()
        };
        metrics.record_round(&stats);
        metrics.record_round(&stats);
        assert_eq!(metrics.rounds, 2);
        assert_eq!(metrics.total_samples, 128);
        assert!((metrics.rewards.average() + 1.0).abs() < 1e-6);
    }
}
