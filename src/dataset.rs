//! Synthetic multi-object scenes for training and evaluation.
//!
//! Each scene scatters a random number of soft blobs over a blank canvas and
//! records the ground-truth object count, which makes step-count accuracy
//! measurable without external data.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{AirError, Result};

/// Configuration of the synthetic scene generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Canvas size as `(height, width)`.
    pub img_size: (usize, usize),
    /// Sprite size as `(height, width)`.
    pub sprite_size: (usize, usize),
    /// Maximum number of objects per scene; counts are uniform in
    /// `0..=max_objects`.
    pub max_objects: usize,
    /// Peak sprite brightness range.
    pub brightness: (f64, f64),
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            img_size: (50, 50),
            sprite_size: (14, 14),
            max_objects: 2,
            brightness: (0.7, 1.0),
        }
    }
}

impl SceneConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sprite_size.0 < 2 || self.sprite_size.1 < 2 {
            return Err(AirError::config(format!(
                "sprite_size must be at least 2x2, got {}x{}",
                self.sprite_size.0, self.sprite_size.1
            )));
        }
        if self.sprite_size.0 > self.img_size.0 || self.sprite_size.1 > self.img_size.1 {
            return Err(AirError::config(format!(
                "sprite {}x{} does not fit into {}x{} images",
                self.sprite_size.0, self.sprite_size.1, self.img_size.0, self.img_size.1
            )));
        }
        let (low, high) = self.brightness;
        if !(0.0 < low && low < high && high <= 1.0) {
            return Err(AirError::config(format!(
                "brightness range must satisfy 0 < low < high <= 1, got ({}, {})",
                low, high
            )));
        }
        Ok(())
    }
}

/// Seeded generator producing batches of scenes with ground-truth counts.
#[derive(Debug)]
pub struct SceneGenerator {
    config: SceneConfig,
    rng: StdRng,
}

impl SceneGenerator {
    /// Creates a generator with a fixed seed.
    pub fn new(config: SceneConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// The generator's configuration.
    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Generates one batch.
    ///
    /// Returns images `[batch, img_h, img_w]` with values in `[0, 1]` and
    /// the object count of each scene.
    pub fn batch(&mut self, batch_size: usize) -> (Array3<f32>, Vec<u32>) {
        let (height, width) = self.config.img_size;
        let mut images = Array3::<f32>::zeros((batch_size, height, width));
        let mut counts = Vec::with_capacity(batch_size);

        for sample in 0..batch_size {
            let objects = self.rng.gen_range(0..=self.config.max_objects);
            counts.push(objects as u32);
            for _ in 0..objects {
                self.place_sprite(&mut images, sample);
            }
        }

        // Overlapping sprites may exceed the pixel range.
        images.mapv_inplace(|v| v.min(1.0));
        (images, counts)
    }

    fn place_sprite(&mut self, images: &mut Array3<f32>, sample: usize) {
        let (height, width) = self.config.img_size;
        let (sprite_h, sprite_w) = self.config.sprite_size;
        let top = self.rng.gen_range(0..=height - sprite_h);
        let left = self.rng.gen_range(0..=width - sprite_w);
        let (low, high) = self.config.brightness;
        let brightness = self.rng.gen_range(low..high) as f32;

        for row in 0..sprite_h {
            for col in 0..sprite_w {
                let dy = (2.0 * row as f32 - (sprite_h - 1) as f32) / sprite_h as f32;
                let dx = (2.0 * col as f32 - (sprite_w - 1) as f32) / sprite_w as f32;
                let value = brightness * (-3.0 * (dx * dx + dy * dy)).exp();
                images[[sample, top + row, left + col]] += value;
            }
        }
    }
}

/// Converts a batch of scenes to a backend tensor `[batch, img_h, img_w]`.
pub fn scenes_to_tensor<B: Backend>(images: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let (batch, height, width) = images.dim();
    let flat: Vec<f32> = images.iter().copied().collect();
    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([batch, height, width])
}

/// Converts ground-truth counts to an integer tensor `[batch]`.
pub fn counts_to_tensor<B: Backend>(counts: &[u32], device: &B::Device) -> Tensor<B, 1, Int> {
    let ints: Vec<i32> = counts.iter().map(|&count| count as i32).collect();
    Tensor::from_ints(ints.as_slice(), device)
}
