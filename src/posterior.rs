//! The weighted terminal population of a finished chain.

use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::Rng;

use crate::chain::IterationStats;
use crate::ledger::ThresholdLedger;
use crate::math::logsumexp;
use crate::population::{Particle, Population};
use crate::var_info::{Point, VarInfo, VarInfoError};

/// Terminal population of a chain together with its ledger.
///
/// The log importance weight of each particle is
/// `prior_logp + beta * likelihood_logp`.
#[derive(Debug, Clone)]
pub struct NestedPosterior {
    chain: u64,
    var_info: VarInfo,
    population: Population,
    ledger: ThresholdLedger,
    history: Vec<IterationStats>,
    k_trunc: f64,
}

impl NestedPosterior {
    pub(crate) fn new(
        chain: u64,
        var_info: VarInfo,
        population: Population,
        ledger: ThresholdLedger,
        history: Vec<IterationStats>,
        k_trunc: f64,
    ) -> Self {
        Self {
            chain,
            var_info,
            population,
            ledger,
            history,
            k_trunc,
        }
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn var_info(&self) -> &VarInfo {
        &self.var_info
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn particles(&self) -> &[Particle] {
        self.population.particles()
    }

    pub fn ledger(&self) -> &ThresholdLedger {
        &self.ledger
    }

    pub fn history(&self) -> &[IterationStats] {
        &self.history
    }

    pub fn log_evidence(&self) -> f64 {
        self.ledger.log_evidence()
    }

    pub fn log_weights(&self) -> &[f64] {
        self.ledger.last_log_weights()
    }

    /// Importance weights that sum to one.
    pub fn normalized_weights(&self) -> Vec<f64> {
        let log_weights = self.log_weights();
        let norm = logsumexp(log_weights);
        log_weights.iter().map(|w| (w - norm).exp()).collect()
    }

    /// Fold every particle back into named variables, in particle order.
    pub fn points(&self) -> Result<Vec<Point>, VarInfoError> {
        self.population
            .positions()
            .map(|position| self.var_info.fold(position))
            .collect()
    }

    /// Weights relative to the largest weight, clipped at
    /// `mean(w) * N^k_trunc`.
    fn truncated_weights(&self) -> Vec<f64> {
        let log_weights = self.log_weights();
        let max = log_weights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let mut weights: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
        let n = weights.len() as f64;
        let limit = weights.iter().sum::<f64>() / n * n.powf(self.k_trunc);
        weights.iter_mut().for_each(|w| *w = w.min(limit));
        weights
    }

    /// Draw `n` equally weighted particles by multinomial resampling.
    ///
    /// Large importance weights are truncated at `mean(w) * N^k_trunc`
    /// before resampling.
    pub fn resample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<Particle> {
        let weights = self.truncated_weights();
        let dist = WeightedIndex::new(&weights)
            .expect("Weights of a non-empty population are finite and positive");
        (0..n)
            .map(|_| self.population.particles()[dist.sample(rng)].clone())
            .collect()
    }
}
