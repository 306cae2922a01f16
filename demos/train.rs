//! Training demo on synthetic multi-object scenes
//!
//! Runs real optimisation steps with the REINFORCE estimator and its learned
//! baseline, then measures how often the inferred step count matches the true
//! number of objects. Logging goes through tracing; set RUST_LOG=debug for
//! per-step output.

use air::dataset::{counts_to_tensor, scenes_to_tensor, SceneConfig, SceneGenerator};
use air::error::Result;
use air::model::{AirConfig, AirModel};
use air::nets::BaselineNet;
use air::prior::NumStepsPrior;
use air::trainer::{count_accuracy, AirTrainer, TrainOptions};
use burn::backend::{Autodiff, NdArray};
use burn::optim::RmsPropConfig;
use tracing_subscriber::EnvFilter;

type Backend = Autodiff<NdArray<f32>>;

const TRAIN_STEPS: usize = 200;
const BATCH_SIZE: usize = 16;
const LOG_EVERY: usize = 25;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== AIR Training Example ===\n");

    let device = Default::default();

    let config = AirConfig {
        img_size: (28, 28),
        crop_size: (12, 12),
        n_appearance: 20,
        max_steps: 3,
        transition_size: 64,
        image_encoder_hidden: vec![128],
        glimpse_encoder_hidden: vec![128],
        glimpse_decoder_hidden: vec![128],
        pose_estimator_hidden: vec![64],
        presence_predictor_hidden: vec![32],
        // Keep a little exploration so presence never saturates early.
        explore_eps: Some(0.05),
        ..AirConfig::default()
    };
    let scenes = SceneConfig {
        img_size: (28, 28),
        sprite_size: (10, 10),
        max_objects: 2,
        brightness: (0.7, 1.0),
    };

    let model = AirModel::<Backend>::new(config.clone(), &device)?;
    let baseline = BaselineNet::new(
        config.img_size.0 * config.img_size.1,
        config.max_steps,
        config.n_appearance,
        &[256, 128],
        &device,
    );

    let options = TrainOptions {
        // Anneal the step prior over the short demo horizon.
        num_steps_prior: Some(NumStepsPrior::exponential(0.99, 1e-3, 2000.0, 50.0)),
        ..TrainOptions::multi_object()
    };
    let mut trainer = AirTrainer::new(
        model,
        Some(baseline),
        RmsPropConfig::new()
            .with_momentum(0.9)
            .with_centered(true)
            .init(),
        RmsPropConfig::new()
            .with_momentum(0.9)
            .with_centered(true)
            .init(),
        options,
    )?;

    println!("Training setup:");
    println!("  Scenes:     28x28 with up to 2 sprites");
    println!("  Model:      12x12 glimpses, 20 appearance dims, 3 steps");
    println!("  Steps:      {} batches of {}", TRAIN_STEPS, BATCH_SIZE);
    println!();

    let mut generator = SceneGenerator::new(scenes.clone(), 7)?;
    for _ in 0..TRAIN_STEPS {
        let (images, _) = generator.batch(BATCH_SIZE);
        let metrics = trainer.step(scenes_to_tensor(&images, &device))?;

        if trainer.global_step() % LOG_EVERY == 0 {
            tracing::info!(
                "step {:>4}  loss {:>9.3}  rec {:>9.3}  baseline {:>9.3}  steps/scene {:.2}",
                trainer.global_step(),
                metrics.loss,
                metrics.rec,
                metrics.baseline_loss.unwrap_or(f32::NAN),
                metrics.num_steps,
            );
        }
    }
    println!();

    // Held-out evaluation: does the inferred step count match the truth?
    println!("Evaluation on held-out scenes:");
    let mut held_out = SceneGenerator::new(scenes, 1234)?;
    let (images, counts) = held_out.batch(64);
    let output = trainer.model().forward(scenes_to_tensor(&images, &device))?;
    let accuracy = count_accuracy(&output, counts_to_tensor(&counts, &device));
    let mean_steps = output.num_steps_per_sample().mean().into_scalar();

    println!("  Count accuracy: {:.1}%", 100.0 * accuracy);
    println!("  Mean steps:     {:.2}", mean_steps);
    println!();
    println!("=== Training Example completed! ===");
    Ok(())
}
