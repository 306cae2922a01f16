//! # Probability Distributions
//!
//! This module provides the distributions used by the inference cell and the
//! training objective.
//!
//! ## Distribution Types
//!
//! | Type | Description | Role |
//! |------|-------------|------|
//! | [`Gaussian`] | Diagonal Gaussian | Appearance, pose, and pixel likelihoods |
//! | [`GaussianHead`] | Linear layer producing a [`Gaussian`] | Appearance posterior head |
//! | [`NumStepsDistribution`] | Distribution over step counts | REINFORCE and the step-count prior |
//!
//! ## Step-Count Semantics
//!
//! The model decides after each inference step whether to keep explaining
//! objects. A chain of Bernoulli presence variables with probabilities
//! `p_1, .., p_T` induces a distribution over the number of steps taken:
//!
//! ```text
//! P(n) = (1 - p_{n+1}) × p_1 × .. × p_n     for n < T
//! P(T) = p_1 × .. × p_T
//! ```
//!
//! [`NumStepsDistribution`] materialises this table, and [`geometric_prior`]
//! with [`tabular_kl`] penalise it towards few steps.

pub mod gaussian;
pub mod num_steps;

pub use gaussian::{Gaussian, GaussianHead};
pub use num_steps::{geometric_prior, tabular_kl, NumStepsDistribution};
