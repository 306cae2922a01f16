//! Feed-forward networks surrounding the inference cell.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Multi-layer perceptron with ReLU hidden activations.
///
/// Without an output head the last hidden layer (ReLU included) is the
/// output; [`Mlp::with_output`] appends a linear projection.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Option<Linear<B>>,
    output_size: usize,
}

impl<B: Backend> Mlp<B> {
    /// Creates an MLP from the given hidden layer widths.
    pub fn new(input_size: usize, hidden_sizes: &[usize], device: &B::Device) -> Self {
        assert!(
            !hidden_sizes.is_empty(),
            "Mlp requires at least one hidden layer"
        );
        let mut hidden = Vec::with_capacity(hidden_sizes.len());
        let mut width = input_size;
        for &size in hidden_sizes {
            hidden.push(LinearConfig::new(width, size).init(device));
            width = size;
        }
        Self {
            hidden,
            output: None,
            output_size: width,
        }
    }

    /// Creates an MLP with a linear output layer of the given width.
    pub fn with_output(
        input_size: usize,
        hidden_sizes: &[usize],
        output_size: usize,
        device: &B::Device,
    ) -> Self {
        let mut mlp = Self::new(input_size, hidden_sizes, device);
        mlp.output = Some(LinearConfig::new(mlp.output_size, output_size).init(device));
        mlp.output_size = output_size;
        mlp
    }

    /// Width of the produced features.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Maps `[batch, input_size]` to `[batch, output_size]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = input;
        for layer in &self.hidden {
            x = activation::relu(layer.forward(x));
        }
        if let Some(output) = &self.output {
            x = output.forward(x);
        }
        x
    }
}

/// Decodes `[appearance ++ pose]` latents into a raw glimpse.
///
/// The output is unbounded; pixels are squashed through a sigmoid only for
/// visualisation, while the reconstruction canvas accumulates raw values.
#[derive(Module, Debug)]
pub struct GlimpseDecoder<B: Backend> {
    mlp: Mlp<B>,
    crop_h: usize,
    crop_w: usize,
}

impl<B: Backend> GlimpseDecoder<B> {
    /// Creates a decoder producing `crop_size` glimpses.
    pub fn new(
        input_size: usize,
        hidden_sizes: &[usize],
        crop_size: (usize, usize),
        device: &B::Device,
    ) -> Self {
        Self {
            mlp: Mlp::with_output(input_size, hidden_sizes, crop_size.0 * crop_size.1, device),
            crop_h: crop_size.0,
            crop_w: crop_size.1,
        }
    }

    /// Maps latents `[batch, input_size]` to glimpses
    /// `[batch, crop_h, crop_w]`.
    pub fn forward(&self, latents: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _] = latents.dims();
        self.mlp
            .forward(latents)
            .reshape([batch, self.crop_h, self.crop_w])
    }
}

/// Estimates the pose posterior parameters from the transition output.
///
/// Produces squashed locations and raw scales for `[sx, tx, sy, ty]`: scales
/// pass through `max_scale * sigmoid`, shifts through `tanh`, and the raw
/// scales receive a constant bias before the posterior's softplus.
#[derive(Module, Debug)]
pub struct PoseEstimator<B: Backend> {
    mlp: Mlp<B>,
    scale_bias: f64,
    max_scale: f64,
}

impl<B: Backend> PoseEstimator<B> {
    /// Creates an estimator reading features of `input_size`.
    pub fn new(input_size: usize, hidden_sizes: &[usize], device: &B::Device) -> Self {
        Self {
            mlp: Mlp::with_output(input_size, hidden_sizes, 8, device),
            scale_bias: -2.0,
            max_scale: 1.0,
        }
    }

    /// Sets the constant bias added to the raw posterior scales.
    pub fn with_scale_bias(mut self, scale_bias: f64) -> Self {
        self.scale_bias = scale_bias;
        self
    }

    /// Sets the upper bound of the crop scales.
    pub fn with_max_scale(mut self, max_scale: f64) -> Self {
        self.max_scale = max_scale;
        self
    }

    /// Maps features `[batch, input_size]` to pose posterior locations and
    /// raw scales, both `[batch, 4]`.
    pub fn forward(&self, features: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let params = self.mlp.forward(features);
        let halves = params.chunk(2, 1);
        let raw_loc = halves[0].clone();
        let raw_scale = halves[1].clone();

        let parts = raw_loc.chunk(4, 1);
        let sx = activation::sigmoid(parts[0].clone()) * self.max_scale;
        let tx = parts[1].clone().tanh();
        let sy = activation::sigmoid(parts[2].clone()) * self.max_scale;
        let ty = parts[3].clone().tanh();
        let loc = Tensor::cat(vec![sx, tx, sy, ty], 1);

        (loc, raw_scale + self.scale_bias)
    }
}

/// Predicts the probability of taking another inference step.
#[derive(Module, Debug)]
pub struct PresencePredictor<B: Backend> {
    mlp: Mlp<B>,
    bias: f64,
}

impl<B: Backend> PresencePredictor<B> {
    /// Creates a predictor reading features of `input_size`.
    pub fn new(input_size: usize, hidden_sizes: &[usize], device: &B::Device) -> Self {
        Self {
            mlp: Mlp::with_output(input_size, hidden_sizes, 1, device),
            bias: 0.0,
        }
    }

    /// Sets the constant logit bias; positive values start inference with a
    /// high probability of taking steps.
    pub fn with_bias(mut self, bias: f64) -> Self {
        self.bias = bias;
        self
    }

    /// Maps features `[batch, input_size]` to probabilities `[batch, 1]`.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        activation::sigmoid(self.mlp.forward(features) + self.bias)
    }
}

/// Control-variate baseline predicting the per-sample loss from the
/// observation and the inference trajectory.
#[derive(Module, Debug)]
pub struct BaselineNet<B: Backend> {
    mlp: Mlp<B>,
    input_size: usize,
}

impl<B: Backend> BaselineNet<B> {
    /// Creates a baseline for flattened images of `n_pix` pixels and
    /// trajectories of `max_steps` steps with `n_appearance` appearance
    /// dimensions.
    pub fn new(
        n_pix: usize,
        max_steps: usize,
        n_appearance: usize,
        hidden_sizes: &[usize],
        device: &B::Device,
    ) -> Self {
        // Per step: appearance, four pose parameters, one presence probability.
        let input_size = n_pix + max_steps * (n_appearance + 4 + 1);
        Self {
            mlp: Mlp::with_output(input_size, hidden_sizes, 1, device),
            input_size,
        }
    }

    /// Expected flattened input width.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Predicts per-sample loss values `[batch, 1]`.
    ///
    /// `images` is `[batch, n_pix]`; the sequences are step-major
    /// `[steps, batch, dim]`.
    pub fn forward(
        &self,
        images: Tensor<B, 2>,
        appearance: Tensor<B, 3>,
        pose: Tensor<B, 3>,
        presence_prob: Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        let input = Tensor::cat(
            vec![
                images,
                flatten_steps(appearance),
                flatten_steps(pose),
                flatten_steps(presence_prob),
            ],
            1,
        );
        self.mlp.forward(input)
    }
}

/// Reorders a step-major sequence `[steps, batch, dim]` into a per-sample
/// feature block `[batch, steps * dim]`.
fn flatten_steps<B: Backend>(sequence: Tensor<B, 3>) -> Tensor<B, 2> {
    let [steps, batch, dim] = sequence.dims();
    sequence.swap_dims(0, 1).reshape([batch, steps * dim])
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
    fn test_mlp_shapes() {
        let device = get_test_device();
        let mlp = Mlp::<TestBackend>::new(10, &[32, 16], &device);
        assert_eq!(mlp.output_size(), 16);
        assert_eq!(mlp.forward(Tensor::zeros([4, 10], &device)).dims(), [4, 16]);

        let headed = Mlp::<TestBackend>::with_output(10, &[32], 3, &device);
        assert_eq!(headed.output_size(), 3);
        assert_eq!(
            headed.forward(Tensor::zeros([4, 10], &device)).dims(),
            [4, 3]
        );
    }

    #[test]
    #[should_panic(expected = "at least one hidden layer")]
    fn test_mlp_rejects_empty_hidden() {
        let device = get_test_device();
        let _ = Mlp::<TestBackend>::new(10, &[], &device);
    }

    #[test]
    fn test_mlp_hidden_output_is_non_negative() {
        let device = get_test_device();
        let mlp = Mlp::<TestBackend>::new(6, &[8], &device);
        let input = Tensor::random(
            [16, 6],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let min = mlp.forward(input).min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_decoder_shapes() {
        let device = get_test_device();
        let decoder = GlimpseDecoder::<TestBackend>::new(12, &[24], (4, 6), &device);

        let glimpses = decoder.forward(Tensor::zeros([3, 12], &device));
        assert_eq!(glimpses.dims(), [3, 4, 6]);
    }

    #[test]
    fn test_pose_estimator_ranges() {
        let device = get_test_device();
        let estimator = PoseEstimator::<TestBackend>::new(8, &[16], &device).with_max_scale(0.8);
        let features = Tensor::random(
            [32, 8],
            burn::tensor::Distribution::Uniform(-3.0, 3.0),
            &device,
        );

        let (loc, raw_scale) = estimator.forward(features);
        assert_eq!(loc.dims(), [32, 4]);
        assert_eq!(raw_scale.dims(), [32, 4]);

        let loc = loc.to_data();
        let loc = loc.as_slice::<f32>().unwrap();
        for sample in loc.chunks(4) {
            // Scales squashed into (0, max_scale), shifts into (-1, 1).
            assert!(sample[0] > 0.0 && sample[0] < 0.8);
            assert!(sample[2] > 0.0 && sample[2] < 0.8);
            assert!(sample[1] > -1.0 && sample[1] < 1.0);
            assert!(sample[3] > -1.0 && sample[3] < 1.0);
        }
    }

    #[test]
    fn test_pose_estimator_scale_bias_shifts_raw_scales() {
        let device = get_test_device();
        let estimator = PoseEstimator::<TestBackend>::new(4, &[8], &device);
        let biased = PoseEstimator {
            mlp: estimator.mlp.clone(),
            scale_bias: estimator.scale_bias - 3.0,
            max_scale: estimator.max_scale,
        };
        let features = Tensor::zeros([2, 4], &device);

        let (_, raw) = estimator.forward(features.clone());
        let (_, raw_biased) = biased.forward(features);

        let diff = (raw - raw_biased).mean().into_scalar();
        assert!((diff - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_presence_predictor_outputs_probabilities() {
        let device = get_test_device();
        let predictor = PresencePredictor::<TestBackend>::new(6, &[8], &device);
        let features = Tensor::random(
            [16, 6],
            burn::tensor::Distribution::Uniform(-2.0, 2.0),
            &device,
        );

        let probs = predictor.forward(features).to_data();
        let probs = probs.as_slice::<f32>().unwrap();
        assert!(probs.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_presence_predictor_bias_saturates() {
        let device = get_test_device();
        let predictor = PresencePredictor::<TestBackend>::new(6, &[8], &device).with_bias(50.0);

        let probs = predictor.forward(Tensor::zeros([4, 6], &device));
        let min = probs.min().into_scalar();
        assert!(min > 0.99);
    }

    #[test]
    fn test_baseline_consumes_trajectories() {
        let device = get_test_device();
        let baseline = BaselineNet::<TestBackend>::new(25, 3, 5, &[16, 8], &device);
        assert_eq!(baseline.input_size(), 25 + 3 * (5 + 4 + 1));

        let value = baseline.forward(
            Tensor::zeros([2, 25], &device),
            Tensor::zeros([3, 2, 5], &device),
            Tensor::zeros([3, 2, 4], &device),
            Tensor::zeros([3, 2, 1], &device),
        );
        assert_eq!(value.dims(), [2, 1]);
    }

    #[test]
    fn test_flatten_steps_orders_by_sample() {
        let device = get_test_device();
        // Two steps, one sample, two dims.
        let sequence = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0, 3.0, 4.0], &device)
            .reshape([2, 1, 2]);

        let flat = flatten_steps(sequence).to_data();
        let flat = flat.as_slice::<f32>().unwrap();
        assert_eq!(flat, &[1.0, 2.0, 3.0, 4.0]);
    }
}
