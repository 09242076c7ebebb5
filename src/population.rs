use rayon::prelude::*;

use crate::error::{NfnsError, NonFiniteDensity, Result};
use crate::model::{LikelihoodOracle, LogDensities};

/// A position in the unconstrained parameter space with its log densities.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    position: Box<[f64]>,
    densities: LogDensities,
}

impl Particle {
    pub fn new(position: Box<[f64]>, densities: LogDensities) -> Self {
        Self {
            position,
            densities,
        }
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn densities(&self) -> LogDensities {
        self.densities
    }

    pub fn prior_logp(&self) -> f64 {
        self.densities.prior_logp
    }

    pub fn likelihood_logp(&self) -> f64 {
        self.densities.likelihood_logp
    }

    /// `prior_logp + beta * likelihood_logp`
    pub fn posterior_logp(&self, beta: f64) -> f64 {
        self.densities.tempered(beta)
    }
}

/// The state of the chain during an evaluation, reported with its errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationContext {
    pub chain: u64,
    pub iteration: u64,
    /// The likelihood cutoff in effect, `-inf` during initialization.
    pub cutoff: f64,
    /// Size of the live population, zero during initialization.
    pub population_size: usize,
}

impl EvaluationContext {
    /// Evaluation of the initial prior draws of a chain.
    pub fn initialization(chain: u64) -> Self {
        Self {
            chain,
            iteration: 0,
            cutoff: f64::NEG_INFINITY,
            population_size: 0,
        }
    }
}

/// The live particles of a chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Population {
    particles: Vec<Particle>,
}

impl Population {
    pub fn new(particles: Vec<Particle>) -> Self {
        Self { particles }
    }

    /// Evaluate the log densities of all positions.
    ///
    /// With `parallel` the evaluations are distributed over the current
    /// rayon thread pool. The order of the particles always matches the order
    /// of `positions`. A failing position aborts the evaluation; if several
    /// positions fail during a parallel evaluation, any one of them is
    /// reported.
    pub fn evaluate<O: LikelihoodOracle>(
        oracle: &O,
        positions: Vec<Box<[f64]>>,
        parallel: bool,
        context: EvaluationContext,
    ) -> Result<Self> {
        let EvaluationContext {
            chain,
            iteration,
            cutoff,
            population_size,
        } = context;
        let evaluate_one = |position: Box<[f64]>| -> Result<Particle> {
            let densities = match oracle.evaluate(&position) {
                Ok(densities) => densities,
                Err(err) => {
                    return Err(NfnsError::ModelEvaluation {
                        chain,
                        iteration,
                        cutoff,
                        population_size,
                        position,
                        source: Box::new(err),
                    })
                }
            };
            if !densities.is_finite() {
                return Err(NfnsError::ModelEvaluation {
                    chain,
                    iteration,
                    cutoff,
                    population_size,
                    position,
                    source: Box::new(NonFiniteDensity {
                        prior_logp: densities.prior_logp,
                        likelihood_logp: densities.likelihood_logp,
                    }),
                });
            }
            Ok(Particle::new(position, densities))
        };

        let particles: Result<Vec<Particle>> = if parallel {
            positions.into_par_iter().map(evaluate_one).collect()
        } else {
            positions.into_iter().map(evaluate_one).collect()
        };
        Ok(Self::new(particles?))
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn into_particles(self) -> Vec<Particle> {
        self.particles
    }

    pub fn positions(&self) -> impl ExactSizeIterator<Item = &[f64]> {
        self.particles.iter().map(|particle| particle.position())
    }

    /// Owned copies of all positions, in particle order.
    pub fn to_positions(&self) -> Vec<Box<[f64]>> {
        self.particles
            .iter()
            .map(|particle| particle.position.clone())
            .collect()
    }

    /// The smallest log likelihood, `None` for an empty population.
    pub fn min_likelihood(&self) -> Option<f64> {
        self.particles
            .iter()
            .map(Particle::likelihood_logp)
            .reduce(f64::min)
    }

    pub fn posterior_logp(&self, beta: f64) -> Vec<f64> {
        self.particles
            .iter()
            .map(|particle| particle.posterior_logp(beta))
            .collect()
    }

    /// Keep only particles whose log likelihood is strictly above `cutoff`.
    pub fn retain_above(&mut self, cutoff: f64) {
        self.particles
            .retain(|particle| particle.likelihood_logp() > cutoff);
    }
}
