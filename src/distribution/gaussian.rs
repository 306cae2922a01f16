//! Diagonal Gaussian distributions with softplus-parameterised scales.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

/// Diagonal Gaussian given by location and scale tensors of matching shape.
///
/// The scale is stored as given and must already be positive; use
/// [`Gaussian::from_raw`] to build one from unconstrained parameters.
#[derive(Debug, Clone)]
pub struct Gaussian<B: Backend, const D: usize> {
    loc: Tensor<B, D>,
    scale: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Gaussian<B, D> {
    /// Creates a Gaussian from a location and a positive scale.
    pub fn new(loc: Tensor<B, D>, scale: Tensor<B, D>) -> Self {
        Self { loc, scale }
    }

    /// Creates a Gaussian from a location and an unconstrained scale, mapped
    /// through softplus to keep it positive.
    pub fn from_raw(loc: Tensor<B, D>, raw_scale: Tensor<B, D>) -> Self {
        Self {
            loc,
            scale: activation::softplus(raw_scale, 1.0),
        }
    }

    /// Location parameter.
    pub fn loc(&self) -> Tensor<B, D> {
        self.loc.clone()
    }

    /// Scale parameter (always positive).
    pub fn scale(&self) -> Tensor<B, D> {
        self.scale.clone()
    }

    /// Mean of the distribution.
    pub fn mean(&self) -> Tensor<B, D> {
        self.loc.clone()
    }

    /// Draws a reparameterised sample: `loc + scale * eps` with
    /// `eps ~ N(0, 1)`. Gradients flow through `loc` and `scale`.
    pub fn sample(&self) -> Tensor<B, D> {
        let eps = Tensor::random(
            self.loc.dims(),
            Distribution::Normal(0.0, 1.0),
            &self.loc.device(),
        );
        self.loc.clone() + self.scale.clone() * eps
    }

    /// Elementwise log-density at `x`.
    pub fn log_prob(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let half_ln_two_pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
        let z = (x - self.loc.clone()) / self.scale.clone();
        z.powf_scalar(2.0) * (-0.5) - self.scale.clone().log() - half_ln_two_pi
    }

    /// Elementwise KL divergence `KL(self || other)`.
    ///
    /// Shapes broadcast, so a scalar-shaped prior can be compared against a
    /// batched posterior.
    pub fn kl(&self, other: &Gaussian<B, D>) -> Tensor<B, D> {
        let var_ratio = (self.scale.clone() / other.scale.clone()).powf_scalar(2.0);
        let mean_term =
            ((self.loc.clone() - other.loc.clone()) / other.scale.clone()).powf_scalar(2.0);
        (var_ratio.clone() + mean_term - var_ratio.log() - 1.0) * 0.5
    }
}

/// Linear head mapping features to a diagonal Gaussian posterior.
///
/// The layer produces `2 * n_params` values, split into locations and raw
/// scales. A constant `scale_offset` is added to the raw scales before the
/// softplus, shifting the initial scale of the posterior.
#[derive(Module, Debug)]
pub struct GaussianHead<B: Backend> {
    transform: Linear<B>,
    n_params: usize,
    scale_offset: f64,
}

impl<B: Backend> GaussianHead<B> {
    /// Creates a head producing an `n_params`-dimensional Gaussian.
    pub fn new(input_size: usize, n_params: usize, device: &B::Device) -> Self {
        Self {
            transform: LinearConfig::new(input_size, 2 * n_params).init(device),
            n_params,
            scale_offset: 0.0,
        }
    }

    /// Sets the constant offset added to the raw scales.
    pub fn with_scale_offset(mut self, scale_offset: f64) -> Self {
        self.scale_offset = scale_offset;
        self
    }

    /// Number of dimensions of the produced Gaussian.
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Maps features `[batch, input_size]` to a Gaussian over
    /// `[batch, n_params]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Gaussian<B, 2> {
        let params = self.transform.forward(input);
        let chunks = params.chunk(2, 1);
        Gaussian::from_raw(chunks[0].clone(), chunks[1].clone() + self.scale_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::backend::Backend as BurnBackend;

    type TestBackend = NdArray<f32>;
    type TestDevice = <TestBackend as BurnBackend>::Device;

    fn get_test_device() -> TestDevice {
        Default::default()
    }

    #[test]
    fn test_from_raw_produces_positive_scale() {
        let device = get_test_device();
        let loc = Tensor::<TestBackend, 1>::zeros([3], &device);
        let raw = Tensor::<TestBackend, 1>::from_floats([-5.0, 0.0, 5.0], &device);

        let gaussian = Gaussian::from_raw(loc, raw);

        let scale = gaussian.scale().to_data();
        let scale = scale.as_slice::<f32>().unwrap();
        assert!(scale.iter().all(|&s| s > 0.0));
        // softplus(0) = ln 2
        assert!((scale[1] - std::f64::consts::LN_2 as f32).abs() < 1e-6);
    }

    #[test]
    fn test_log_prob_standard_normal() {
        let device = get_test_device();
        let gaussian = Gaussian::new(
            Tensor::<TestBackend, 1>::zeros([1], &device),
            Tensor::<TestBackend, 1>::ones([1], &device),
        );

        let log_prob = gaussian
            .log_prob(Tensor::from_floats([0.0], &device))
            .into_scalar();

        // log N(0 | 0, 1) = -0.5 ln(2 pi)
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln();
        assert!((log_prob - expected as f32).abs() < 1e-5);
    }

    #[test]
    fn test_kl_with_itself_is_zero() {
        let device = get_test_device();
        let gaussian = Gaussian::new(
            Tensor::<TestBackend, 2>::from_floats([[0.5, -1.0], [2.0, 0.0]], &device),
            Tensor::<TestBackend, 2>::from_floats([[0.3, 1.0], [2.0, 0.7]], &device),
        );

        let kl = gaussian.kl(&gaussian.clone()).abs().sum().into_scalar();
        assert!(kl < 1e-6);
    }

    #[test]
    fn test_kl_known_value() {
        let device = get_test_device();
        // KL(N(1, 1) || N(0, 1)) = mu^2 / 2 = 0.5
        let posterior = Gaussian::new(
            Tensor::<TestBackend, 1>::from_floats([1.0], &device),
            Tensor::<TestBackend, 1>::ones([1], &device),
        );
        let prior = Gaussian::new(
            Tensor::<TestBackend, 1>::zeros([1], &device),
            Tensor::<TestBackend, 1>::ones([1], &device),
        );

        let kl = posterior.kl(&prior).into_scalar();
        assert!((kl - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sample_shape_and_determinism_at_zero_scale() {
        let device = get_test_device();
        let loc = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let scale = Tensor::<TestBackend, 2>::zeros([2, 2], &device);

        let sample = Gaussian::new(loc.clone(), scale).sample();

        assert_eq!(sample.dims(), [2, 2]);
        // With zero scale the sample collapses onto the mean.
        let diff = (sample - loc).abs().sum().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_head_shapes() {
        let device = get_test_device();
        let head = GaussianHead::<TestBackend>::new(8, 3, &device);
        let input = Tensor::zeros([4, 8], &device);

        let gaussian = head.forward(input);

        assert_eq!(head.n_params(), 3);
        assert_eq!(gaussian.loc().dims(), [4, 3]);
        assert_eq!(gaussian.scale().dims(), [4, 3]);
    }

    #[test]
    fn test_head_scale_offset_shrinks_scale() {
        let device = get_test_device();
        let input = Tensor::<TestBackend, 2>::zeros([2, 4], &device);

        let head = GaussianHead::<TestBackend>::new(4, 2, &device);
        let offset_head = GaussianHead::<TestBackend>::new(4, 2, &device).with_scale_offset(-5.0);

        // With zero input only the bias and the offset reach the softplus,
        // so a strongly negative offset must shrink the scale.
        let base = head.forward(input.clone()).scale().mean().into_scalar();
        let shifted = offset_head.forward(input).scale().mean().into_scalar();
        assert!(shifted < base + 1e-3);
    }
}
