//! PPO loss terms

use burn::prelude::*;

/// Per-sample clipped surrogate loss `-min(r·A, clip(r, 1-ε, 1+ε)·A)`
pub fn clipped_surrogate<B: Backend>(
    ratio: Tensor<B, 1>,
    advantages: Tensor<B, 1>,
    clip_epsilon: f32,
) -> Tensor<B, 1> {
    let clipped_ratio = ratio.clone().clamp(1.0 - clip_epsilon, 1.0 + clip_epsilon);
    let surr1 = ratio * advantages.clone();
    let surr2 = clipped_ratio * advantages;
    surr1.min_pair(surr2).neg()
}

/// Loss coefficients
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub clip_epsilon: f32,
    pub value_coef: f32,
    pub entropy_coef: f32,
}

pub struct PpoLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub policy: Tensor<B, 1>,
    pub value: Tensor<B, 1>,
    pub entropy: Tensor<B, 1>,
}

/// Combined PPO objective for one minibatch
pub fn ppo_loss<B: Backend>(
    new_log_probs: Tensor<B, 1>,
    old_log_probs: Tensor<B, 1>,
    advantages: Tensor<B, 1>,
    values: Tensor<B, 1>,
    returns: Tensor<B, 1>,
    entropy: Tensor<B, 1>,
    weights: LossWeights,
) -> PpoLoss<B> {
    let ratio = (new_log_probs - old_log_probs).exp();
    let policy = clipped_surrogate(ratio, advantages, weights.clip_epsilon).mean();
    let value = (values - returns).powf_scalar(2.0).mean();
    let entropy = entropy.mean();

    let total = policy.clone() + value.clone().mul_scalar(weights.value_coef)
        - entropy.clone().mul_scalar(weights.entropy_coef);

    PpoLoss {
        total,
        policy,
        value,
        entropy,
    }
}
