//! Model assembly: configuration, the unrolled inference pass, and its
//! stacked outputs.

use burn::module::Module;
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::cell::{AirCell, AirStepOutput};
use crate::distribution::{Gaussian, NumStepsDistribution};
use crate::error::{AirError, Result};

/// Model configuration.
///
/// The defaults follow the 50x50 multi-object setting: 20x20 glimpses, a
/// 256-unit transition, and up to three inference steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirConfig {
    /// Input image size as `(height, width)`.
    pub img_size: (usize, usize),
    /// Attention glimpse size as `(height, width)`.
    pub crop_size: (usize, usize),
    /// Width of the appearance code.
    pub n_appearance: usize,
    /// Maximum number of inference steps.
    pub max_steps: usize,
    /// Width of the recurrent transition state.
    pub transition_size: usize,
    /// Hidden widths of the image encoder.
    pub image_encoder_hidden: Vec<usize>,
    /// Hidden widths of the glimpse encoder.
    pub glimpse_encoder_hidden: Vec<usize>,
    /// Hidden widths of the glimpse decoder.
    pub glimpse_decoder_hidden: Vec<usize>,
    /// Hidden widths of the pose estimator.
    pub pose_estimator_hidden: Vec<usize>,
    /// Hidden widths of the presence predictor.
    pub presence_predictor_hidden: Vec<usize>,
    /// Standard deviation of the pixel likelihood.
    pub output_std: f64,
    /// Raw-scale offset of the appearance posterior.
    pub appearance_scale_offset: f64,
    /// Raw-scale bias of the pose posterior.
    pub pose_scale_bias: f64,
    /// Logit bias of the presence predictor.
    pub presence_bias: f64,
    /// Upper bound of the crop scales.
    pub max_scale: f64,
    /// Sample hard Bernoulli presences instead of using soft probabilities.
    pub discrete_steps: bool,
    /// Exploration floor keeping presence probabilities in
    /// `[eps, 1 - eps]` via a straight-through clip.
    pub explore_eps: Option<f64>,
    /// Check intermediate distributions for non-finite values.
    pub debug: bool,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self {
            img_size: (50, 50),
            crop_size: (20, 20),
            n_appearance: 50,
            max_steps: 3,
            transition_size: 256,
            image_encoder_hidden: vec![256, 256],
            glimpse_encoder_hidden: vec![256, 256],
            glimpse_decoder_hidden: vec![252, 252],
            pose_estimator_hidden: vec![256, 256],
            presence_predictor_hidden: vec![50],
            output_std: 0.3,
            appearance_scale_offset: -1.0,
            pose_scale_bias: -2.0,
            presence_bias: 0.0,
            max_scale: 1.0,
            discrete_steps: true,
            explore_eps: None,
            debug: false,
        }
    }
}

impl AirConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        for (name, (height, width)) in [("img_size", self.img_size), ("crop_size", self.crop_size)]
        {
            if height < 2 || width < 2 {
                return Err(AirError::config(format!(
                    "{} must be at least 2x2, got {}x{}",
                    name, height, width
                )));
            }
        }
        for (name, value) in [
            ("n_appearance", self.n_appearance),
            ("max_steps", self.max_steps),
            ("transition_size", self.transition_size),
        ] {
            if value == 0 {
                return Err(AirError::config(format!("{} must be positive", name)));
            }
        }
        for (name, hidden) in [
            ("image_encoder_hidden", &self.image_encoder_hidden),
            ("glimpse_encoder_hidden", &self.glimpse_encoder_hidden),
            ("glimpse_decoder_hidden", &self.glimpse_decoder_hidden),
            ("pose_estimator_hidden", &self.pose_estimator_hidden),
            ("presence_predictor_hidden", &self.presence_predictor_hidden),
        ] {
            if hidden.is_empty() || hidden.contains(&0) {
                return Err(AirError::config(format!(
                    "{} must list positive layer widths",
                    name
                )));
            }
        }
        if self.output_std <= 0.0 {
            return Err(AirError::config(format!(
                "output_std must be positive, got {}",
                self.output_std
            )));
        }
        if self.max_scale <= 0.0 {
            return Err(AirError::config(format!(
                "max_scale must be positive, got {}",
                self.max_scale
            )));
        }
        if let Some(eps) = self.explore_eps {
            if !(0.0..0.5).contains(&eps) || eps == 0.0 {
                return Err(AirError::config(format!(
                    "explore_eps must lie in (0, 0.5), got {}",
                    eps
                )));
            }
        }
        Ok(())
    }
}

/// Stacked per-step outputs of a full inference pass.
///
/// Sequence tensors are step-major `[steps, batch, dim]`.
#[derive(Debug, Clone)]
pub struct AirOutput<B: Backend> {
    /// Canvas after each step `[steps, batch, n_pix]`.
    pub canvases: Tensor<B, 3>,
    /// Raw decoded glimpses `[steps, batch, crop_h * crop_w]`.
    pub glimpses: Tensor<B, 3>,
    /// Appearance samples `[steps, batch, n_appearance]`.
    pub appearance: Tensor<B, 3>,
    /// Appearance posterior locations.
    pub appearance_loc: Tensor<B, 3>,
    /// Appearance posterior scales.
    pub appearance_scale: Tensor<B, 3>,
    /// Pose samples `[steps, batch, 4]`.
    pub pose: Tensor<B, 3>,
    /// Pose posterior locations.
    pub pose_loc: Tensor<B, 3>,
    /// Pose posterior scales.
    pub pose_scale: Tensor<B, 3>,
    /// Presence probabilities `[steps, batch, 1]`.
    pub presence_prob: Tensor<B, 3>,
    /// Presence indicators `[steps, batch, 1]`.
    pub presence: Tensor<B, 3>,
    /// Final reconstruction `[batch, img_h, img_w]`.
    pub final_canvas: Tensor<B, 3>,
    output_std: f64,
    crop_h: usize,
    crop_w: usize,
}

fn stack_steps<B: Backend>(parts: Vec<Tensor<B, 2>>) -> Tensor<B, 3> {
    Tensor::stack(parts, 0)
}

impl<B: Backend> AirOutput<B> {
    fn stack(
        steps: Vec<AirStepOutput<B>>,
        img_size: (usize, usize),
        crop_size: (usize, usize),
        output_std: f64,
    ) -> Self {
        assert!(!steps.is_empty(), "at least one inference step is required");
        let [batch, _] = steps[0].canvas.dims();
        let final_canvas = steps[steps.len() - 1]
            .canvas
            .clone()
            .reshape([batch, img_size.0, img_size.1]);

        Self {
            canvases: stack_steps(steps.iter().map(|s| s.canvas.clone()).collect()),
            glimpses: stack_steps(steps.iter().map(|s| s.glimpse.clone()).collect()),
            appearance: stack_steps(steps.iter().map(|s| s.appearance.clone()).collect()),
            appearance_loc: stack_steps(steps.iter().map(|s| s.appearance_loc.clone()).collect()),
            appearance_scale: stack_steps(
                steps.iter().map(|s| s.appearance_scale.clone()).collect(),
            ),
            pose: stack_steps(steps.iter().map(|s| s.pose.clone()).collect()),
            pose_loc: stack_steps(steps.iter().map(|s| s.pose_loc.clone()).collect()),
            pose_scale: stack_steps(steps.iter().map(|s| s.pose_scale.clone()).collect()),
            presence_prob: stack_steps(steps.iter().map(|s| s.presence_prob.clone()).collect()),
            presence: stack_steps(steps.iter().map(|s| s.presence.clone()).collect()),
            final_canvas,
            output_std,
            crop_h: crop_size.0,
            crop_w: crop_size.1,
        }
    }

    /// Number of inference steps per sample `[batch]`, the sum of presence
    /// indicators over steps.
    pub fn num_steps_per_sample(&self) -> Tensor<B, 1> {
        let [_, batch, _] = self.presence.dims();
        self.presence.clone().sum_dim(0).reshape([batch])
    }

    /// Posterior over the number of steps, induced by the presence
    /// probabilities.
    pub fn num_steps_distribution(&self) -> NumStepsDistribution<B> {
        let [steps, batch, _] = self.presence_prob.dims();
        let probs = self
            .presence_prob
            .clone()
            .reshape([steps, batch])
            .swap_dims(0, 1);
        NumStepsDistribution::new(probs)
    }

    /// Pixel likelihood centred on the final canvas.
    pub fn output_distribution(&self) -> Gaussian<B, 3> {
        let scale = Tensor::full(
            self.final_canvas.dims(),
            self.output_std,
            &self.final_canvas.device(),
        );
        Gaussian::new(self.final_canvas.clone(), scale)
    }

    /// Presence-weighted sigmoid glimpses `[steps, batch, crop_h, crop_w]`
    /// for visualisation.
    pub fn rendered_glimpses(&self) -> Tensor<B, 4> {
        let [steps, batch, _] = self.glimpses.dims();
        (activation::sigmoid(self.glimpses.clone()) * self.presence.clone())
            .reshape([steps, batch, self.crop_h, self.crop_w])
    }
}

/// Attend, Infer, Repeat model: unrolls the inference cell over a fixed
/// maximum number of steps.
#[derive(Module, Debug)]
pub struct AirModel<B: Backend> {
    /// The shared inference cell.
    pub cell: AirCell<B>,
    max_steps: usize,
    output_std: f64,
}

impl<B: Backend> AirModel<B> {
    /// Builds the model after validating the configuration.
    pub fn new(config: AirConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cell: AirCell::new(&config, device),
            max_steps: config.max_steps,
            output_std: config.output_std,
        })
    }

    /// Maximum number of inference steps.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Standard deviation of the pixel likelihood.
    pub fn output_std(&self) -> f64 {
        self.output_std
    }

    /// Runs the full inference pass over `[batch, img_h, img_w]` images.
    pub fn forward(&self, images: Tensor<B, 3>) -> Result<AirOutput<B>> {
        let mut state = self.cell.initial_state(images);
        let mut steps = Vec::with_capacity(self.max_steps);
        for _ in 0..self.max_steps {
            let (output, next) = self.cell.forward(state)?;
            steps.push(output);
            state = next;
        }
        Ok(AirOutput::stack(
            steps,
            self.cell.img_size(),
            self.cell.crop_size(),
            self.output_std,
        ))
    }
}
