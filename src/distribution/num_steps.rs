//! Distribution over the number of inference steps.

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor};

use crate::ops::ClipPreserveGradient;

/// Distribution over `{0, .., max_steps}` induced by a chain of Bernoulli
/// presence variables.
///
/// The count `n` corresponds to the event "the first `n` presence variables
/// were one and the next was zero"; taking all `max_steps` steps absorbs the
/// remaining mass. Built from per-step presence probabilities of shape
/// `[batch, max_steps]`.
#[derive(Debug, Clone)]
pub struct NumStepsDistribution<B: Backend> {
    steps_probs: Tensor<B, 2>,
    table: Tensor<B, 2>,
}

impl<B: Backend> NumStepsDistribution<B> {
    /// Builds the distribution from presence probabilities `[batch, steps]`.
    pub fn new(steps_probs: Tensor<B, 2>) -> Self {
        let [batch, steps] = steps_probs.dims();
        let device = steps_probs.device();

        let mut columns = Vec::with_capacity(steps + 1);
        let mut running = Tensor::ones([batch, 1], &device);
        for step in 0..steps {
            let p = steps_probs.clone().slice([0..batch, step..step + 1]);
            columns.push(running.clone() * (p.clone().neg() + 1.0));
            running = running * p;
        }
        columns.push(running);

        // The chain telescopes to unit mass; renormalise for float safety.
        let table = Tensor::cat(columns, 1);
        let table = table.clone() / table.sum_dim(1);

        Self { steps_probs, table }
    }

    /// Probability table `[batch, steps + 1]` over step counts.
    pub fn probs(&self) -> Tensor<B, 2> {
        self.table.clone()
    }

    /// Probability of the given per-sample counts `[batch]`.
    pub fn prob(&self, counts: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [batch, _] = self.table.dims();
        self.table
            .clone()
            .gather(1, counts.reshape([batch, 1]))
            .reshape([batch])
    }

    /// Log-probability of the given counts `[batch]`.
    ///
    /// The probability is floored at `1e-16` with an identity-gradient clip
    /// before the logarithm, and the result clamped to `[-1e38, 1e38]`.
    pub fn log_prob(&self, counts: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.prob(counts)
            .clip_preserve_gradient(1e-16, 1.0)
            .log()
            .clamp(-1e38, 1e38)
    }

    /// Samples step counts `[batch]` by running the Bernoulli chain.
    pub fn sample(&self) -> Tensor<B, 1, Int> {
        let [batch, steps] = self.steps_probs.dims();
        let device = self.steps_probs.device();

        let uniform = Tensor::random([batch, steps], Distribution::Uniform(0.0, 1.0), &device);
        let bernoulli = uniform.lower(self.steps_probs.clone()).float();

        // A step counts only when every earlier step was taken.
        let mut running = Tensor::ones([batch, 1], &device);
        let mut count = Tensor::zeros([batch, 1], &device);
        for step in 0..steps {
            running = running * bernoulli.clone().slice([0..batch, step..step + 1]);
            count = count + running.clone();
        }
        count.reshape([batch]).int()
    }
}

/// Geometric distribution over `{0, .., n_steps}` with the given success
/// probability, shape `[n_steps + 1]`.
///
/// The tail mass beyond `n_steps` is dropped, so the table is slightly
/// unnormalised; the KL against it remains well defined.
pub fn geometric_prior<B: Backend>(
    success_prob: f64,
    n_steps: usize,
    device: &B::Device,
) -> Tensor<B, 1> {
    let mut probs = Vec::with_capacity(n_steps + 1);
    let mut term = 1.0 - success_prob;
    for _ in 0..=n_steps {
        probs.push(term as f32);
        term *= success_prob;
    }
    Tensor::from_floats(probs.as_slice(), device)
}

/// Elementwise KL contribution `p * (log p - log q)` between probability
/// tables, with shapes broadcasting.
///
/// Entries are floored at `1e-37` inside the logarithms, so rows containing
/// exact zeros contribute zero instead of NaN.
pub fn tabular_kl<B: Backend>(p: Tensor<B, 2>, q: Tensor<B, 2>) -> Tensor<B, 2> {
    let p_safe = p.clone().clamp_min(1e-37);
    let q_safe = q.clamp_min(1e-37);
    p * (p_safe.log() - q_safe.log())
}
