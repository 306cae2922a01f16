//! Prior configuration and annealing schedules for the training objective.

use serde::{Deserialize, Serialize};

use crate::error::{AirError, Result};

/// Diagonal Gaussian prior given by a scalar location and scale, broadcast
/// over every latent dimension it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPrior {
    /// Prior mean.
    pub loc: f64,
    /// Prior standard deviation.
    pub scale: f64,
}

impl GaussianPrior {
    /// Creates a prior with the given location and scale.
    pub fn new(loc: f64, scale: f64) -> Self {
        Self { loc, scale }
    }

    /// Checks that the scale is positive.
    pub fn validate(&self) -> Result<()> {
        if self.scale <= 0.0 {
            return Err(AirError::config(format!(
                "prior scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Prior over the pose shift components.
///
/// When `loc` is `None` the prior mean tracks the posterior mean, so only the
/// posterior scale is penalised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShiftPrior {
    /// Fixed prior mean, or `None` to track the posterior mean.
    pub loc: Option<f64>,
    /// Prior standard deviation.
    pub scale: f64,
}

impl ShiftPrior {
    /// Creates a shift prior that tracks the posterior mean.
    pub fn tracking(scale: f64) -> Self {
        Self { loc: None, scale }
    }

    /// Creates a shift prior with a fixed mean.
    pub fn fixed(loc: f64, scale: f64) -> Self {
        Self {
            loc: Some(loc),
            scale,
        }
    }

    /// Checks that the scale is positive.
    pub fn validate(&self) -> Result<()> {
        if self.scale <= 0.0 {
            return Err(AirError::config(format!(
                "shift prior scale must be positive, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Annealing mode for the step-count prior's success probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Anneal {
    /// Success probability stays at `start`.
    #[default]
    Constant,
    /// Exponential decay from `start` towards `end`.
    Exponential,
    /// Linear interpolation from `start` to `end`.
    Linear,
}

/// Geometric prior over the number of inference steps with an annealed
/// success probability.
///
/// Annealing starts the success probability near one, so early training
/// explains scenes with many steps, and decays it towards `end` to prefer
/// parsimonious explanations later on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumStepsPrior {
    /// Annealing mode.
    pub anneal: Anneal,
    /// Success probability at step zero.
    pub start: f64,
    /// Success probability floor reached after `steps` global steps.
    pub end: f64,
    /// Number of global steps over which the schedule runs.
    pub steps: f64,
    /// Staircase divisor for the exponential schedule.
    pub steps_div: f64,
}

impl NumStepsPrior {
    /// Constant success probability.
    pub fn constant(value: f64) -> Self {
        Self {
            anneal: Anneal::Constant,
            start: value,
            end: value,
            steps: 1.0,
            steps_div: 1.0,
        }
    }

    /// Exponential decay from `start` to `end` over `steps` global steps,
    /// discretised in increments of `steps_div`.
    pub fn exponential(start: f64, end: f64, steps: f64, steps_div: f64) -> Self {
        Self {
            anneal: Anneal::Exponential,
            start,
            end,
            steps,
            steps_div,
        }
    }

    /// Linear interpolation from `start` to `end` over `steps` global steps.
    pub fn linear(start: f64, end: f64, steps: f64) -> Self {
        Self {
            anneal: Anneal::Linear,
            start,
            end,
            steps,
            steps_div: 1.0,
        }
    }

    /// Checks that the schedule parameters are consistent.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("start", self.start), ("end", self.end)] {
            if !(0.0..1.0).contains(&value) || value == 0.0 {
                return Err(AirError::config(format!(
                    "step prior {} must lie in (0, 1), got {}",
                    name, value
                )));
            }
        }
        if self.start < self.end {
            return Err(AirError::config(format!(
                "step prior start ({}) must not be below end ({})",
                self.start, self.end
            )));
        }
        if self.steps <= 0.0 || self.steps_div <= 0.0 {
            return Err(AirError::config(
                "step prior steps and steps_div must be positive",
            ));
        }
        Ok(())
    }

    /// Annealed success probability at the given global step, floored at
    /// `end`.
    pub fn success_prob(&self, global_step: usize) -> f64 {
        let t = global_step as f64;
        let value = match self.anneal {
            Anneal::Constant => self.start,
            Anneal::Exponential => {
                let decay_rate = (self.end / self.start).powf(self.steps_div / self.steps);
                self.start * decay_rate.powf(t / self.steps_div)
            }
            Anneal::Linear => self.end + (self.start - self.end) * (1.0 - t / self.steps),
        };
        value.max(self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let prior = NumStepsPrior::constant(0.5);
        assert!(prior.validate().is_ok());
        assert_eq!(prior.success_prob(0), 0.5);
        assert_eq!(prior.success_prob(1_000_000), 0.5);
    }

    #[test]
    fn test_exponential_schedule_endpoints() {
        let prior = NumStepsPrior::exponential(1.0 - 1e-7, 1e-5, 1e5, 1e4);
        assert!(prior.validate().is_ok());

        assert!((prior.success_prob(0) - (1.0 - 1e-7)).abs() < 1e-9);
        // At the schedule horizon the decay reaches the floor.
        assert!((prior.success_prob(100_000) - 1e-5).abs() < 1e-7);
        // Beyond the horizon the floor holds.
        assert_eq!(prior.success_prob(10_000_000), 1e-5);
    }

    #[test]
    fn test_exponential_schedule_is_non_increasing() {
        let prior = NumStepsPrior::exponential(0.9, 0.01, 1000.0, 100.0);
        let mut previous = f64::INFINITY;
        for step in (0..2000).step_by(50) {
            let value = prior.success_prob(step);
            assert!(value <= previous + 1e-12);
            assert!(value >= prior.end - 1e-12);
            previous = value;
        }
    }

    #[test]
    fn test_linear_schedule() {
        let prior = NumStepsPrior::linear(0.9, 0.1, 100.0);
        assert!((prior.success_prob(0) - 0.9).abs() < 1e-12);
        // Midpoint: end + (start - end) / 2
        assert!((prior.success_prob(50) - 0.5).abs() < 1e-12);
        assert!((prior.success_prob(100) - 0.1).abs() < 1e-12);
        assert_eq!(prior.success_prob(500), 0.1);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(NumStepsPrior::constant(0.0).validate().is_err());
        assert!(NumStepsPrior::constant(1.0).validate().is_err());
        assert!(NumStepsPrior::linear(0.1, 0.9, 100.0).validate().is_err());
        assert!(NumStepsPrior::exponential(0.9, 0.1, 0.0, 1.0).validate().is_err());

        assert!(GaussianPrior::new(0.0, 0.0).validate().is_err());
        assert!(GaussianPrior::new(0.0, 1.0).validate().is_ok());
        assert!(ShiftPrior::tracking(-1.0).validate().is_err());
        assert!(ShiftPrior::fixed(0.0, 1.0).validate().is_ok());
    }
}
