//! Shared-trunk actor-critic network using Burn framework

use burn::module::{Module, Param};
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;
use burn::tensor::TensorData;
use burn::tensor::activation::log_softmax;
use rand::Rng;
use rand::rngs::StdRng;

use crate::config::ModelConfig;
use crate::sim::Observation;

use super::weights::{ParamTensor, WeightBlob, WeightError};

/// Logit offset applied to masked actions
const MASKED_LOGIT: f32 = 1e9;

/// Network shape; identical for every junction
#[derive(Debug, Config)]
pub struct PolicyConfig {
    /// Length of the padded observation vector
    pub obs_size: usize,
    /// Size of the shared action head
    pub num_actions: usize,
    /// Widths of the shared trunk layers
    #[config(default = "vec![64, 64]")]
    pub hidden_sizes: Vec<usize>,
}

impl PolicyConfig {
    pub fn from_model(obs_size: usize, num_actions: usize, model: &ModelConfig) -> Self {
        Self::new(obs_size, num_actions).with_hidden_sizes(model.hidden_sizes.clone())
    }

    pub fn same_shape(&self, other: &PolicyConfig) -> bool {
        self.obs_size == other.obs_size
            && self.num_actions == other.num_actions
            && self.hidden_sizes == other.hidden_sizes
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> PolicyValueNet<B> {
        PolicyValueNet::new(device, self)
    }
}

/// Action picked for one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionChoice {
    pub action: usize,
    pub log_prob: f32,
    pub value: f32,
}

/// Actor-critic with a shared trunk
#[derive(Module, Debug)]
pub struct PolicyValueNet<B: Backend> {
    /// Shared hidden layers
    trunk: Vec<Linear<B>>,
    /// Logits over the action head
    actor: Linear<B>,
    /// State value
    critic: Linear<B>,
    activation: Relu,
}

impl<B: Backend> PolicyValueNet<B> {
    pub fn new(device: &B::Device, config: &PolicyConfig) -> Self {
        let mut trunk = Vec::new();
        let mut width = config.obs_size;
        for &hidden in &config.hidden_sizes {
            trunk.push(LinearConfig::new(width, hidden).init(device));
            width = hidden;
        }

        Self {
            trunk,
            actor: LinearConfig::new(width, config.num_actions).init(device),
            critic: LinearConfig::new(width, 1).init(device),
            activation: Relu::new(),
        }
    }

    /// Raw logits `[batch, actions]` and values `[batch]`
    pub fn forward(&self, obs: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mut x = obs;
        for layer in &self.trunk {
            x = self.activation.forward(layer.forward(x));
        }
        (self.actor.forward(x.clone()), self.critic.forward(x).squeeze(1))
    }

    /// Log-probabilities with invalid actions pushed to -1e9 before the softmax
    /// mask: [batch, actions] where 1.0 = valid, 0.0 = invalid
    pub fn masked_log_probs(
        &self,
        obs: Tensor<B, 2>,
        mask: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (logits, values) = self.forward(obs);
        let masked = logits + mask.sub_scalar(1.0).mul_scalar(MASKED_LOGIT);
        (log_softmax(masked, 1), values)
    }

    /// Log-probabilities of `actions`, policy entropy and values
    pub fn evaluate_actions(
        &self,
        obs: Tensor<B, 2>,
        mask: Tensor<B, 2>,
        actions: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>) {
        let (log_probs, values) = self.masked_log_probs(obs, mask);
        let batch_size = actions.dims()[0];

        let taken = log_probs
            .clone()
            .gather(1, actions.reshape([batch_size, 1]))
            .squeeze::<1>(1);
        let entropy = (log_probs.clone().exp() * log_probs)
            .sum_dim(1)
            .squeeze::<1>(1)
            .neg();

        (taken, entropy, values)
    }

    fn device(&self) -> B::Device {
        self.actor.weight.val().device()
    }

    /// Log-probabilities and value for a single observation
    pub fn distribution(&self, observation: &Observation) -> (Vec<f32>, f32) {
        let device = self.device();
        let obs = Tensor::<B, 1>::from_floats(observation.features.as_slice(), &device)
            .reshape([1, observation.features.len()]);
        let mask = Tensor::<B, 1>::from_floats(observation.mask.as_slice(), &device)
            .reshape([1, observation.mask.len()]);

        let (log_probs, values) = self.masked_log_probs(obs, mask);
        let log_probs: Vec<f32> = log_probs.into_data().iter::<f32>().collect();
        let value = values.into_data().iter::<f32>().next().unwrap_or(0.0);
        (log_probs, value)
    }

    /// Training-time selection: sample from the categorical distribution
    pub fn sample_action(&self, observation: &Observation, rng: &mut StdRng) -> ActionChoice {
        let (log_probs, value) = self.distribution(observation);
        let action = sample_categorical(&log_probs, rng);
        ActionChoice {
            action,
            log_prob: log_probs.get(action).copied().unwrap_or(f32::NEG_INFINITY),
            value,
        }
    }

    /// Inference-time selection: argmax, lowest index on ties
    pub fn greedy_action(&self, observation: &Observation) -> ActionChoice {
        let (log_probs, value) = self.distribution(observation);
        let action = argmax(&log_probs);
        ActionChoice {
            action,
            log_prob: log_probs.get(action).copied().unwrap_or(f32::NEG_INFINITY),
            value,
        }
    }

    pub fn value(&self, observation: &Observation) -> f32 {
        self.distribution(observation).1
    }

    fn layers(&self) -> impl Iterator<Item = &Linear<B>> {
        self.trunk.iter().chain([&self.actor, &self.critic])
    }

    /// Export every parameter in layer order
    pub fn to_blob(&self) -> WeightBlob {
        let mut tensors = Vec::new();
        for layer in self.layers() {
            tensors.push(param_tensor(layer.weight.val()));
            if let Some(bias) = &layer.bias {
                tensors.push(param_tensor(bias.val()));
            }
        }
        WeightBlob::new(tensors)
    }

    /// Replace every parameter from `blob`. Parameter ids are kept, so
    /// optimizer state stays attached to the same parameters.
    pub fn load_blob(self, blob: &WeightBlob) -> Result<Self, WeightError> {
        blob.check_shape(&self.to_blob())?;
        let device = self.device();
        let mut tensors = blob.tensors.iter();

        let mut trunk = Vec::with_capacity(self.trunk.len());
        for layer in self.trunk {
            trunk.push(load_linear(layer, &mut tensors, &device)?);
        }
        let actor = load_linear(self.actor, &mut tensors, &device)?;
        let critic = load_linear(self.critic, &mut tensors, &device)?;

        Ok(Self {
            trunk,
            actor,
            critic,
            activation: self.activation,
        })
    }
}

fn param_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> ParamTensor {
    let shape = tensor.dims().to_vec();
    ParamTensor::new(shape, tensor.into_data().iter::<f32>().collect())
}

fn next_tensor<'a, B: Backend, const D: usize>(
    tensors: &mut impl Iterator<Item = &'a ParamTensor>,
    device: &B::Device,
) -> Result<Tensor<B, D>, WeightError> {
    let tensor = tensors.next().ok_or(WeightError::TensorCount {
        expected: 1,
        found: 0,
    })?;
    Ok(Tensor::from_data(
        TensorData::new(tensor.values.clone(), tensor.shape.clone()),
        device,
    ))
}

fn load_linear<'a, B: Backend>(
    mut linear: Linear<B>,
    tensors: &mut impl Iterator<Item = &'a ParamTensor>,
    device: &B::Device,
) -> Result<Linear<B>, WeightError> {
    let weight = next_tensor::<B, 2>(tensors, device)?;
    linear.weight = Param::initialized(linear.weight.id, weight.require_grad());
    if let Some(bias) = linear.bias.take() {
        let values = next_tensor::<B, 1>(tensors, device)?;
        linear.bias = Some(Param::initialized(bias.id, values.require_grad()));
    }
    Ok(linear)
}

/// Inverse-CDF draw from log-probabilities
pub fn sample_categorical(log_probs: &[f32], rng: &mut StdRng) -> usize {
    let draw = rng.random::<f32>();
    let mut cumulative = 0.0;
    for (action, log_prob) in log_probs.iter().enumerate() {
        cumulative += log_prob.exp();
        if draw < cumulative {
            return action;
        }
    }
    // rounding left a sliver at the top
    argmax(log_probs)
}

pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (index, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = index;
        }
    }
    best
}
