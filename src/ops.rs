//! Tensor utilities shared across the model.
//!
//! Provides the straight-through clip used for exploration floors, the
//! additive loss accumulator, and the L2 penalty over weight matrices.

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

/// Clamps a tensor to `[min, max]` while keeping the identity gradient.
///
/// The forward value is the clamped tensor; the backward pass treats the
/// operation as the identity, so gradients flow unchanged even for elements
/// outside the range.
pub fn clip_with_identity_gradient<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    min: f64,
    max: f64,
) -> Tensor<B, D> {
    let clipped = x.clone().clamp(min, max);
    x.clone() + (clipped - x).detach()
}

/// Extension trait applying the straight-through clip directly on tensors.
pub trait ClipPreserveGradient {
    /// Clamps values to `[min, max]` while letting gradients pass through.
    fn clip_preserve_gradient(self, min: f64, max: f64) -> Self;
}

impl<B: Backend, const D: usize> ClipPreserveGradient for Tensor<B, D> {
    fn clip_preserve_gradient(self, min: f64, max: f64) -> Self {
        clip_with_identity_gradient(self, min, max)
    }
}

/// Returns true if the tensor contains any NaN or infinite entries.
pub(crate) fn has_non_finite<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> bool {
    let nan = tensor.clone().is_nan().int().sum().into_scalar().elem::<i64>();
    let inf = tensor.clone().is_inf().int().sum().into_scalar().elem::<i64>();
    nan + inf > 0
}

/// Additive loss accumulator tracking the scalar objective together with its
/// per-sample decomposition.
#[derive(Debug, Clone)]
pub struct Loss<B: Backend> {
    value: Tensor<B, 1>,
    per_sample: Tensor<B, 1>,
}

impl<B: Backend> Loss<B> {
    /// Creates a zero loss for the given batch size.
    pub fn new(batch_size: usize, device: &B::Device) -> Self {
        Self {
            value: Tensor::zeros([1], device),
            per_sample: Tensor::zeros([batch_size], device),
        }
    }

    /// Adds a term given as a scalar and its per-sample decomposition.
    pub fn add(&mut self, value: Tensor<B, 1>, per_sample: Tensor<B, 1>) {
        self.value = self.value.clone() + value;
        self.per_sample = self.per_sample.clone() + per_sample;
    }

    /// Scalar total, shape `[1]`.
    pub fn value(&self) -> Tensor<B, 1> {
        self.value.clone()
    }

    /// Per-sample totals, shape `[batch_size]`.
    pub fn per_sample(&self) -> Tensor<B, 1> {
        self.per_sample.clone()
    }
}

struct SquaredWeightNorm<B: Backend> {
    total: Tensor<B, 1>,
}

impl<B: Backend> ModuleVisitor<B> for SquaredWeightNorm<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        // Weight decay applies to weight matrices only; biases and other
        // vector parameters are skipped.
        if D == 2 {
            self.total = self.total.clone() + tensor.clone().powf_scalar(2.0).sum() * 0.5;
        }
    }
}

/// Sums `||w||^2 / 2` over every rank-2 parameter of a module.
pub fn l2_penalty<B: Backend, M: Module<B>>(module: &M, device: &B::Device) -> Tensor<B, 1> {
    let mut visitor = SquaredWeightNorm {
        total: Tensor::zeros([1], device),
    };
    module.visit(&mut visitor);
    visitor.total
}
