//! Loss terms: reconstruction, latent priors, and the REINFORCE surrogate.
//!
//! Every term comes as a `(scalar, per_sample)` pair so the training step can
//! accumulate both the optimisation objective and the per-sample loss that
//! feeds the REINFORCE importance weights.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::distribution::{geometric_prior, tabular_kl, Gaussian, NumStepsDistribution};
use crate::model::AirOutput;
use crate::prior::{GaussianPrior, ShiftPrior};

fn scalar_gaussian<B: Backend>(loc: f64, scale: f64, device: &B::Device) -> Gaussian<B, 3> {
    Gaussian::new(
        Tensor::full([1, 1, 1], loc, device),
        Tensor::full([1, 1, 1], scale, device),
    )
}

/// Negative log-likelihood of the images under the pixel distribution
/// centred on the final canvas.
pub fn reconstruction_nll<B: Backend>(
    output: &AirOutput<B>,
    images: &Tensor<B, 3>,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let [batch, height, width] = images.dims();
    let log_prob = output.output_distribution().log_prob(images.clone());
    let per_sample = log_prob
        .reshape([batch, height * width])
        .sum_dim(1)
        .reshape([batch])
        .neg();
    (per_sample.clone().mean(), per_sample)
}

/// KL of the step-count posterior from the geometric prior with the given
/// success probability.
pub fn num_steps_kl<B: Backend>(
    distrib: &NumStepsDistribution<B>,
    success_prob: f64,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let table = distrib.probs();
    let [batch, n] = table.dims();
    let prior = geometric_prior::<B>(success_prob, n - 1, &table.device()).reshape([1, n]);

    let per_sample = tabular_kl(table, prior).sum_dim(1).reshape([batch]);
    (per_sample.clone().mean(), per_sample)
}

/// Presence-gated KL of the appearance posterior from its prior, summed over
/// latent dimensions and steps.
pub fn appearance_kl<B: Backend>(
    output: &AirOutput<B>,
    prior: &GaussianPrior,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let device = output.appearance_loc.device();
    let posterior = Gaussian::new(
        output.appearance_loc.clone(),
        output.appearance_scale.clone(),
    );
    let prior = scalar_gaussian::<B>(prior.loc, prior.scale, &device);

    let gated = posterior.kl(&prior).sum_dim(2) * output.presence.clone();
    let [_, batch, _] = gated.dims();
    let per_sample = gated.sum_dim(0).reshape([batch]);
    (per_sample.clone().mean(), per_sample)
}

/// Presence-gated KL of the pose posterior, split into scale and shift
/// components with separate priors.
///
/// With a tracking [`ShiftPrior`] the shift prior is centred on the
/// posterior mean, so only the posterior scales are pulled towards the
/// prior.
pub fn pose_kl<B: Backend>(
    output: &AirOutput<B>,
    scale_prior: &GaussianPrior,
    shift_prior: &ShiftPrior,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let device = output.pose_loc.device();
    let loc_parts = output.pose_loc.clone().chunk(4, 2);
    let scale_parts = output.pose_scale.clone().chunk(4, 2);

    // Pose layout is [sx, tx, sy, ty]: even entries scale, odd entries shift.
    let scale_posterior = Gaussian::new(
        Tensor::cat(vec![loc_parts[0].clone(), loc_parts[2].clone()], 2),
        Tensor::cat(vec![scale_parts[0].clone(), scale_parts[2].clone()], 2),
    );
    let scale_kl = scale_posterior.kl(&scalar_gaussian::<B>(
        scale_prior.loc,
        scale_prior.scale,
        &device,
    ));

    let shift_loc = Tensor::cat(vec![loc_parts[1].clone(), loc_parts[3].clone()], 2);
    let shift_posterior = Gaussian::new(
        shift_loc.clone(),
        Tensor::cat(vec![scale_parts[1].clone(), scale_parts[3].clone()], 2),
    );
    let shift_prior = match shift_prior.loc {
        Some(loc) => scalar_gaussian::<B>(loc, shift_prior.scale, &device),
        None => Gaussian::new(
            shift_loc,
            Tensor::full([1, 1, 1], shift_prior.scale, &device),
        ),
    };
    let shift_kl = shift_posterior.kl(&shift_prior);

    let gated = (scale_kl + shift_kl).sum_dim(2) * output.presence.clone();
    let [_, batch, _] = gated.dims();
    let per_sample = gated.sum_dim(0).reshape([batch]);
    (per_sample.clone().mean(), per_sample)
}

/// REINFORCE surrogate for the discrete step count.
///
/// The importance weight is the per-sample loss minus the baseline, treated
/// as a constant; minimising the surrogate pushes the step-count posterior
/// towards cheaper explanations. Returns the scalar surrogate and the
/// importance weights.
pub fn reinforce_surrogate<B: Backend>(
    distrib: &NumStepsDistribution<B>,
    num_steps_per_sample: Tensor<B, 1>,
    per_sample_loss: Tensor<B, 1>,
    baseline: Option<Tensor<B, 1>>,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let log_prob = distrib.log_prob(num_steps_per_sample.int());
    // The baseline enters as a constant; its own regression loss is the only
    // path that trains it.
    let importance = match baseline {
        Some(baseline) => per_sample_loss - baseline.detach(),
        None => per_sample_loss,
    };
    let surrogate = (importance.clone().detach() * log_prob).mean();
    (surrogate, importance)
}

/// Mean squared error pulling the baseline towards the per-sample loss.
///
/// The target is detached, so this gradient trains the baseline only.
pub fn baseline_mse<B: Backend>(
    per_sample_loss: Tensor<B, 1>,
    baseline: Tensor<B, 1>,
) -> Tensor<B, 1> {
    (per_sample_loss.detach() - baseline).powf_scalar(2.0).mean()
}
