//! On-policy experience storage and advantage estimation

/// One junction's transition for one shared tick
#[derive(Debug, Clone, PartialEq)]
pub struct ExperienceStep {
    pub observation: Vec<f32>,
    /// Valid actions at collection time
    pub mask: Vec<f32>,
    pub action: usize,
    /// Log-probability under the collecting policy
    pub log_prob: f32,
    pub reward: f32,
    pub value: f32,
    pub done: bool,
    pub tick: u64,
}

/// Rollout for a single junction and a single round
#[derive(Debug, Clone, Default)]
pub struct RolloutBuffer {
    steps: Vec<ExperienceStep>,
}

impl RolloutBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: ExperienceStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    pub fn steps(&self) -> &[ExperienceStep] {
        &self.steps
    }

    pub fn mean_reward(&self) -> f32 {
        if self.steps.is_empty() {
            0.0
        } else {
            self.steps.iter().map(|s| s.reward).sum::<f32>() / self.steps.len() as f32
        }
    }

    /// Episode ends inside the rollout
    pub fn episodes_ended(&self) -> usize {
        self.steps.iter().filter(|s| s.done).count()
    }

    /// Compute returns and advantages using GAE
    pub fn compute_returns_and_advantages(
        &self,
        last_value: f32,
        gamma: f32,
        gae_lambda: f32,
    ) -> (Vec<f32>, Vec<f32>) {
        let n = self.len();
        let mut returns = vec![0.0; n];
        let mut advantages = vec![0.0; n];

        let mut gae = 0.0;
        let mut next_value = last_value;

        for t in (0..n).rev() {
            let step = &self.steps[t];
            let not_done = if step.done { 0.0 } else { 1.0 };
            let delta = step.reward + gamma * next_value * not_done - step.value;
            gae = delta + gamma * gae_lambda * not_done * gae;
            advantages[t] = gae;
            returns[t] = gae + step.value;
            next_value = step.value;
        }

        (returns, advantages)
    }
}

/// Zero mean, unit variance
pub fn normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    let std = var.sqrt().max(1e-8);
    values.iter().map(|v| (v - mean) / std).collect()
}
