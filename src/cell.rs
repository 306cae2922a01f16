//! The recurrent inference cell at the core of the model.
//!
//! One forward call explains one object: the cell attends to a region of the
//! image, infers the object's appearance and pose, decides whether the object
//! exists, and paints it onto the reconstruction canvas.

use burn::module::{Module, Param};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

use crate::distribution::{Gaussian, GaussianHead};
use crate::error::{AirError, Result};
use crate::model::AirConfig;
use crate::nets::{GlimpseDecoder, Mlp, PoseEstimator, PresencePredictor};
use crate::ops::{self, ClipPreserveGradient};
use crate::stn::SpatialTransformer;
use crate::transition::LstmTransition;

/// Number of pose parameters `[sx, tx, sy, ty]`.
pub const N_POSE_PARAMS: usize = 4;

/// State threaded through inference steps.
#[derive(Debug, Clone)]
pub struct AirState<B: Backend> {
    /// Flattened input image `[batch, n_pix]`, constant across steps.
    pub image: Tensor<B, 2>,
    /// Reconstruction canvas accumulated so far `[batch, n_pix]`.
    pub canvas: Tensor<B, 2>,
    /// Appearance code from the previous step `[batch, n_appearance]`.
    pub appearance: Tensor<B, 2>,
    /// Pose code from the previous step `[batch, 4]`.
    pub pose: Tensor<B, 2>,
    /// Transition `(hidden, cell)` state.
    pub hidden: (Tensor<B, 2>, Tensor<B, 2>),
    /// Running presence `[batch, 1]`; once zero, later steps stay zero.
    pub presence: Tensor<B, 2>,
}

/// Everything a single inference step emits.
#[derive(Debug, Clone)]
pub struct AirStepOutput<B: Backend> {
    /// Canvas after this step `[batch, n_pix]`.
    pub canvas: Tensor<B, 2>,
    /// Raw decoded glimpse `[batch, crop_h * crop_w]`.
    pub glimpse: Tensor<B, 2>,
    /// Appearance sample `[batch, n_appearance]`.
    pub appearance: Tensor<B, 2>,
    /// Appearance posterior location.
    pub appearance_loc: Tensor<B, 2>,
    /// Appearance posterior scale.
    pub appearance_scale: Tensor<B, 2>,
    /// Pose sample `[batch, 4]`.
    pub pose: Tensor<B, 2>,
    /// Pose posterior location.
    pub pose_loc: Tensor<B, 2>,
    /// Pose posterior scale.
    pub pose_scale: Tensor<B, 2>,
    /// Presence probability after the exploration clip `[batch, 1]`.
    pub presence_prob: Tensor<B, 2>,
    /// Presence indicator `[batch, 1]`.
    pub presence: Tensor<B, 2>,
}

/// Recurrent inference cell.
///
/// Fields are public so experiments can swap or inspect individual
/// components, mirroring how the networks compose at the call sites.
#[derive(Module, Debug)]
pub struct AirCell<B: Backend> {
    /// Encodes the flattened image for the transition input.
    pub image_encoder: Mlp<B>,
    /// Projects `[encoding ++ appearance ++ pose ++ presence]` onto the
    /// transition input, without activation.
    pub rnn_projection: Linear<B>,
    /// Recurrent transition.
    pub transition: LstmTransition<B>,
    /// Pose posterior head.
    pub pose_estimator: PoseEstimator<B>,
    /// Presence probability head.
    pub presence_predictor: PresencePredictor<B>,
    /// Encodes cropped glimpses for the appearance posterior.
    pub glimpse_encoder: Mlp<B>,
    /// Appearance posterior head.
    pub appearance_head: GaussianHead<B>,
    /// Decodes latents back into glimpses.
    pub glimpse_decoder: GlimpseDecoder<B>,
    /// Crop and paste between image and glimpse frames.
    pub transformer: SpatialTransformer<B>,
    appearance_init: Param<Tensor<B, 2>>,
    pose_init: Param<Tensor<B, 2>>,
    img_h: usize,
    img_w: usize,
    crop_h: usize,
    crop_w: usize,
    n_appearance: usize,
    discrete_steps: bool,
    explore_eps: Option<f64>,
    debug: bool,
}

fn init_seed<B: Backend>(shape: [usize; 2], device: &B::Device) -> Param<Tensor<B, 2>> {
    Param::from_tensor(Tensor::random(shape, Distribution::Uniform(-0.1, 0.1), device))
}

impl<B: Backend> AirCell<B> {
    /// Creates the cell from a validated configuration.
    pub fn new(config: &AirConfig, device: &B::Device) -> Self {
        let n_pix = config.img_size.0 * config.img_size.1;
        let n_crop_pix = config.crop_size.0 * config.crop_size.1;

        let image_encoder = Mlp::new(n_pix, &config.image_encoder_hidden, device);
        let rnn_input_size =
            image_encoder.output_size() + config.n_appearance + N_POSE_PARAMS + 1;
        let glimpse_encoder = Mlp::new(n_crop_pix, &config.glimpse_encoder_hidden, device);
        let appearance_head =
            GaussianHead::new(glimpse_encoder.output_size(), config.n_appearance, device)
                .with_scale_offset(config.appearance_scale_offset);

        Self {
            rnn_projection: LinearConfig::new(rnn_input_size, config.transition_size)
                .init(device),
            transition: LstmTransition::new(
                config.transition_size,
                config.transition_size,
                device,
            ),
            pose_estimator: PoseEstimator::new(
                config.transition_size,
                &config.pose_estimator_hidden,
                device,
            )
            .with_scale_bias(config.pose_scale_bias)
            .with_max_scale(config.max_scale),
            presence_predictor: PresencePredictor::new(
                config.transition_size,
                &config.presence_predictor_hidden,
                device,
            )
            .with_bias(config.presence_bias),
            glimpse_encoder,
            appearance_head,
            glimpse_decoder: GlimpseDecoder::new(
                config.n_appearance + N_POSE_PARAMS,
                &config.glimpse_decoder_hidden,
                config.crop_size,
                device,
            ),
            transformer: SpatialTransformer::new(config.img_size, config.crop_size),
            appearance_init: init_seed([1, config.n_appearance], device),
            pose_init: init_seed([1, N_POSE_PARAMS], device),
            image_encoder,
            img_h: config.img_size.0,
            img_w: config.img_size.1,
            crop_h: config.crop_size.0,
            crop_w: config.crop_size.1,
            n_appearance: config.n_appearance,
            discrete_steps: config.discrete_steps,
            explore_eps: config.explore_eps,
            debug: config.debug,
        }
    }

    /// Image size as `(height, width)`.
    pub fn img_size(&self) -> (usize, usize) {
        (self.img_h, self.img_w)
    }

    /// Crop size as `(height, width)`.
    pub fn crop_size(&self) -> (usize, usize) {
        (self.crop_h, self.crop_w)
    }

    /// Appearance code width.
    pub fn n_appearance(&self) -> usize {
        self.n_appearance
    }

    /// Initial state for a batch of images `[batch, img_h, img_w]`.
    ///
    /// The canvas starts blank, presence at one, and the latent seeds are
    /// trainable parameters broadcast over the batch.
    pub fn initial_state(&self, images: Tensor<B, 3>) -> AirState<B> {
        let [batch, height, width] = images.dims();
        assert_eq!(
            (height, width),
            (self.img_h, self.img_w),
            "expected {}x{} images, got {}x{}",
            self.img_h,
            self.img_w,
            height,
            width
        );
        let device = images.device();
        let n_pix = self.img_h * self.img_w;

        AirState {
            image: images.reshape([batch, n_pix]),
            canvas: Tensor::zeros([batch, n_pix], &device),
            appearance: self
                .appearance_init
                .val()
                .expand([batch, self.n_appearance]),
            pose: self.pose_init.val().expand([batch, N_POSE_PARAMS]),
            hidden: self.transition.init_state(batch),
            presence: Tensor::ones([batch, 1], &device),
        }
    }

    /// Runs one inference step, returning the step emission and the state
    /// for the next step.
    pub fn forward(&self, state: AirState<B>) -> Result<(AirStepOutput<B>, AirState<B>)> {
        let AirState {
            image,
            canvas,
            appearance,
            pose,
            hidden,
            presence,
        } = state;
        let [batch, n_pix] = image.dims();
        let n_crop_pix = self.crop_h * self.crop_w;

        // Condition the transition on the image and the previous step.
        let encoding = self.image_encoder.forward(image.clone());
        let rnn_input = Tensor::cat(vec![encoding, appearance, pose, presence.clone()], 1);
        let rnn_input = self.rnn_projection.forward(rnn_input);
        let (features, cell) = self.transition.forward(rnn_input, hidden);
        let hidden = (features.clone(), cell);

        // Where: sample a pose and crop the attended glimpse.
        let (pose_loc, pose_raw_scale) = self.pose_estimator.forward(features.clone());
        let pose_posterior = Gaussian::from_raw(pose_loc, pose_raw_scale);
        self.check_finite(&pose_posterior.loc(), "pose posterior location")?;
        self.check_finite(&pose_posterior.scale(), "pose posterior scale")?;
        let pose = pose_posterior.sample();
        let glimpse = self
            .transformer
            .forward(image.clone().reshape([batch, self.img_h, self.img_w]), pose.clone());

        // Whether: decide if this step explains an object.
        let presence_prob = self.presence_predictor.forward(features);
        let presence_prob = match self.explore_eps {
            Some(eps) => presence_prob.clip_preserve_gradient(eps, 1.0 - eps),
            None => presence_prob,
        };
        self.check_finite(&presence_prob, "presence probability")?;
        let presence = if self.discrete_steps {
            let uniform = Tensor::random(
                [batch, 1],
                Distribution::Uniform(0.0, 1.0),
                &presence_prob.device(),
            );
            let sampled = uniform.lower(presence_prob.clone()).float();
            // Sampling is gated by the previous presence, so the chain of
            // step indicators is non-increasing.
            presence * sampled
        } else {
            presence_prob.clone()
        };

        // What: infer the appearance from the attended glimpse.
        let glimpse_features = self
            .glimpse_encoder
            .forward(glimpse.reshape([batch, n_crop_pix]));
        let appearance_posterior = self.appearance_head.forward(glimpse_features);
        self.check_finite(&appearance_posterior.loc(), "appearance posterior location")?;
        self.check_finite(&appearance_posterior.scale(), "appearance posterior scale")?;
        let appearance = appearance_posterior.sample();

        // Decode and paint. The pose is detached here so the decoder shapes
        // the glimpse while the pose gradients flow only through attention.
        let latent = Tensor::cat(vec![appearance.clone(), pose.clone().detach()], 1);
        let decoded = self.glimpse_decoder.forward(latent);
        let pasted = self
            .transformer
            .inverse(decoded.clone(), pose.clone())
            .reshape([batch, n_pix]);
        let canvas = canvas + pasted * presence.clone();

        let output = AirStepOutput {
            canvas: canvas.clone(),
            glimpse: decoded.reshape([batch, n_crop_pix]),
            appearance: appearance.clone(),
            appearance_loc: appearance_posterior.loc(),
            appearance_scale: appearance_posterior.scale(),
            pose: pose.clone(),
            pose_loc: pose_posterior.loc(),
            pose_scale: pose_posterior.scale(),
            presence_prob: presence_prob.clone(),
            presence: presence.clone(),
        };
        let state = AirState {
            image,
            canvas,
            appearance,
            pose,
            hidden,
            presence,
        };
        Ok((output, state))
    }

    fn check_finite<const D: usize>(&self, tensor: &Tensor<B, D>, what: &str) -> Result<()> {
        if self.debug && ops::has_non_finite(tensor) {
            return Err(AirError::non_finite(what));
        }
        Ok(())
    }
}
