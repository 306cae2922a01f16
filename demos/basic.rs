//! Basic usage example of the AIR model
//!
//! This example builds a small model, runs the unrolled inference pass on
//! generated multi-object scenes, and inspects what each step produced.

use air::dataset::{scenes_to_tensor, SceneConfig, SceneGenerator};
use air::error::Result;
use air::model::{AirConfig, AirModel};
use burn::backend::NdArray;

fn main() -> Result<()> {
    println!("=== AIR Basic Example ===\n");

    // Use the NdArray backend (CPU)
    type Backend = NdArray<f32>;
    let device = Default::default();

    // Example 1: Build a model for 28x28 scenes
    println!("Example 1: Model construction");
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
        ..AirConfig::default()
    };
    let model = AirModel::<Backend>::new(config.clone(), &device)?;

    println!("Created AIR model:");
    println!("  Image size:      {:?}", config.img_size);
    println!("  Glimpse size:    {:?}", config.crop_size);
    println!("  Appearance dims: {}", config.n_appearance);
    println!("  Max steps:       {}", config.max_steps);
    println!();

    // Example 2: Generate scenes with known object counts
    println!("Example 2: Synthetic scenes");
    let scenes = SceneConfig {
        img_size: (28, 28),
        sprite_size: (10, 10),
        max_objects: 2,
        brightness: (0.7, 1.0),
    };
    let mut generator = SceneGenerator::new(scenes, 42)?;
    let (images, counts) = generator.batch(6);

    println!("  Generated {} scenes", counts.len());
    println!("  True object counts: {:?}", counts);
    println!();

    // Example 3: Run the unrolled inference pass
    println!("Example 3: Inference");
    let output = model.forward(scenes_to_tensor(&images, &device))?;

    println!("  Canvases shape:  {:?}", output.canvases.dims());
    println!("  Glimpses shape:  {:?}", output.glimpses.dims());
    println!("  Poses shape:     {:?}", output.pose.dims());
    println!("  Presence shape:  {:?}", output.presence.dims());
    println!("  Reconstruction:  {:?}", output.final_canvas.dims());
    println!();

    // Example 4: Inferred step counts (untrained, so these are arbitrary)
    println!("Example 4: Inferred steps per scene");
    let steps = output.num_steps_per_sample();
    for (sample, &truth) in counts.iter().enumerate() {
        let inferred = steps.clone().slice([sample..sample + 1]).into_scalar();
        println!("  Scene {}: inferred {} (true {})", sample, inferred, truth);
    }
    println!();

    // Example 5: The posterior over step counts for the first scene
    println!("Example 5: Step-count posterior of scene 0");
    let table = output.num_steps_distribution().probs();
    let [_, entries] = table.dims();
    for count in 0..entries {
        let prob = table.clone().slice([0..1, count..count + 1]).into_scalar();
        println!("  P(n = {}) = {:.4}", count, prob);
    }
    println!();

    println!("=== Example completed successfully! ===");
    Ok(())
}
