//! # AIR - Attend, Infer, Repeat
//!
//! Structured generative modelling of images with the Burn framework,
//! following "Attend, Infer, Repeat: Fast Scene Understanding with
//! Generative Models" (Eslami et al., 2016, <https://arxiv.org/abs/1603.08575>).
//!
//! ## Features
//!
//! - **Recurrent attention**: an LSTM-driven cell explains one object per
//!   step and paints it onto a running canvas
//! - **Spatial transformer**: differentiable crop and paste between image
//!   and glimpse coordinates
//! - **Variational posteriors**: Gaussian appearance and pose codes plus a
//!   Bernoulli chain over the number of steps
//! - **Discrete-step training**: REINFORCE with a learned baseline, or soft
//!   presence probabilities as a relaxation
//! - **Priors with annealing**: truncated geometric step prior whose success
//!   probability follows a configurable schedule
//! - **Synthetic scenes**: seeded multi-object sprite data with ground-truth
//!   counts for measuring step accuracy
//!
//! ## Quick Start
//!
//! ```rust
//! use air::prelude::*;
//! use burn::backend::NdArray;
//! use burn::tensor::Tensor;
//!
//! type Backend = NdArray<f32>;
//!
//! let device = Default::default();
//! let config = AirConfig {
//!     img_size: (14, 14),
//!     crop_size: (6, 6),
//!     n_appearance: 8,
//!     max_steps: 2,
//!     transition_size: 32,
//!     image_encoder_hidden: vec![32],
//!     glimpse_encoder_hidden: vec![32],
//!     glimpse_decoder_hidden: vec![32],
//!     pose_estimator_hidden: vec![32],
//!     presence_predictor_hidden: vec![16],
//!     ..AirConfig::default()
//! };
//!
//! let model = AirModel::<Backend>::new(config, &device)?;
//! let images = Tensor::<Backend, 3>::zeros([4, 14, 14], &device);
//! let output = model.forward(images)?;
//!
//! assert_eq!(output.final_canvas.dims(), [4, 14, 14]);
//! assert_eq!(output.presence.dims(), [2, 4, 1]);
//! # Ok::<(), AirError>(())
//! ```
//!
//! ## Training
//!
//! Training couples the model with a baseline network and an optimizer pair
//! (the baseline learns at ten times the model rate):
//!
//! ```ignore
//! use air::prelude::*;
//! use burn::optim::RmsPropConfig;
//!
//! let options = TrainOptions::multi_object();
//! let mut trainer = AirTrainer::new(
//!     model,
//!     Some(baseline),
//!     RmsPropConfig::new().with_momentum(0.9).with_centered(true).init(),
//!     RmsPropConfig::new().with_momentum(0.9).with_centered(true).init(),
//!     options,
//! )?;
//!
//! let metrics = trainer.step(images)?;
//! println!("objective {:.3}", metrics.objective);
//! ```

pub mod cell;
pub mod dataset;
pub mod distribution;
pub mod error;
pub mod loss;
pub mod model;
pub mod nets;
pub mod ops;
pub mod prior;
pub mod stn;
pub mod trainer;
pub mod transition;

pub mod prelude {
    pub use crate::cell::{AirCell, AirState, AirStepOutput};
    pub use crate::dataset::{counts_to_tensor, scenes_to_tensor, SceneConfig, SceneGenerator};
    pub use crate::distribution::{Gaussian, GaussianHead, NumStepsDistribution};
    pub use crate::error::{AirError, Result};
    pub use crate::model::{AirConfig, AirModel, AirOutput};
    pub use crate::nets::{BaselineNet, GlimpseDecoder, Mlp, PoseEstimator, PresencePredictor};
    pub use crate::prior::{Anneal, GaussianPrior, NumStepsPrior, ShiftPrior};
    pub use crate::stn::SpatialTransformer;
    pub use crate::trainer::{
        count_accuracy, training_terms, AirMetrics, AirTrainer, TrainOptions, TrainingTerms,
    };
    pub use crate::transition::LstmTransition;
}
