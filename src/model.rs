//! Core abstractions for the models that are sampled.
//!
//! A [`Model`] knows how to draw from its prior and hands out a
//! [`LikelihoodOracle`] that evaluates the prior and likelihood log densities
//! of flat parameter vectors.

use anyhow::Result;
use rand::Rng;

use crate::var_info::Point;

/// Prior and likelihood log densities of one parameter vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogDensities {
    pub prior_logp: f64,
    pub likelihood_logp: f64,
}

impl LogDensities {
    pub fn new(prior_logp: f64, likelihood_logp: f64) -> Self {
        Self {
            prior_logp,
            likelihood_logp,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.prior_logp.is_finite() & self.likelihood_logp.is_finite()
    }

    /// The tempered posterior log density `prior + beta * likelihood`.
    pub fn tempered(&self, beta: f64) -> f64 {
        self.prior_logp + beta * self.likelihood_logp
    }
}

/// Evaluate the log densities of a model for flat parameter vectors.
///
/// Implementations must be pure: evaluating the same position twice gives
/// the same result, and evaluation of different positions may happen
/// concurrently from several threads.
pub trait LikelihoodOracle: Sync {
    type Err: std::error::Error + Send + Sync + 'static;

    /// The length of the flat parameter vector.
    fn dim(&self) -> usize;

    fn evaluate(&self, position: &[f64]) -> std::result::Result<LogDensities, Self::Err>;
}

impl<O: LikelihoodOracle + ?Sized> LikelihoodOracle for &O {
    type Err = O::Err;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn evaluate(&self, position: &[f64]) -> std::result::Result<LogDensities, Self::Err> {
        (**self).evaluate(position)
    }
}

/// A model that can be sampled with nested sampling.
///
/// The trait is thread-safe so that independent chains can share it.
pub trait Model: Send + Sync + 'static {
    type Oracle<'model>: LikelihoodOracle
    where
        Self: 'model;

    /// Returns the density evaluator of this model.
    fn oracle(&self) -> Result<Self::Oracle<'_>>;

    /// A point that determines the names, order and shapes of the variables.
    fn initial_point(&self) -> Result<Point>;

    /// Draw `draws` independent points from the prior.
    ///
    /// Each point must contain at least the variables in `var_names`.
    fn sample_prior<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        draws: usize,
        var_names: &[&str],
    ) -> Result<Vec<Point>>;
}
