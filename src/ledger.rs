//! Likelihood cutoffs, importance weights and the running evidence estimate
//! of one chain.
//!
//! The ledger is append-only. Iteration `t` holds the cutoff `L_cut[t]`, the
//! log importance weights `prior_logp + beta * likelihood_logp` of the
//! population that was alive after iteration `t`, and the log evidence
//! accumulated so far.
//!
//! The evidence increment of an iteration is the log-sum-exp of the weights
//! of the retained particles, normalized by the number of candidates that
//! were drawn in that iteration:
//!
//! ```text
//! log_Z[t+1] = logaddexp(log_Z[t], logsumexp(w[t+1]) - ln(num_candidates))
//! ```
//!
//! with `log_Z[0] = -inf`.

use crate::error::{NfnsError, Result};
use crate::math::{logaddexp, logsumexp};
use crate::population::Population;

/// The changes that a successful [`ThresholdLedger::advance`] committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerUpdate {
    pub cutoff: f64,
    pub log_evidence: f64,
    /// `log_evidence[t+1] - log_evidence[t]`
    pub log_evidence_increment: f64,
    pub num_retained: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdLedger {
    cutoffs: Vec<f64>,
    log_weights: Vec<Box<[f64]>>,
    log_evidence: Vec<f64>,
}

impl ThresholdLedger {
    /// Start a ledger from the initial population.
    ///
    /// The first cutoff is the smallest log likelihood of the population.
    pub fn new(chain: u64, initial: &Population, beta: f64) -> Result<Self> {
        let Some(cutoff) = initial.min_likelihood() else {
            return Err(NfnsError::EmptyPopulation {
                chain,
                iteration: 0,
                cutoff: f64::NEG_INFINITY,
                num_candidates: 0,
            });
        };
        Ok(Self {
            cutoffs: vec![cutoff],
            log_weights: vec![initial.posterior_logp(beta).into()],
            log_evidence: vec![f64::NEG_INFINITY],
        })
    }

    /// Record the population that survived the filter of an iteration.
    ///
    /// All checks run before anything is recorded, so a failing call leaves
    /// the ledger unchanged.
    pub fn advance(
        &mut self,
        chain: u64,
        iteration: u64,
        retained: &Population,
        beta: f64,
        num_candidates: usize,
    ) -> Result<LedgerUpdate> {
        let previous = self.cutoff();
        let Some(next) = retained.min_likelihood() else {
            return Err(NfnsError::EmptyPopulation {
                chain,
                iteration,
                cutoff: previous,
                num_candidates,
            });
        };
        // Also rejects a NaN cutoff.
        if !(next >= previous) {
            return Err(NfnsError::InvariantViolation {
                chain,
                iteration,
                previous,
                next,
                population_size: retained.len(),
            });
        }

        let weights = retained.posterior_logp(beta);
        let num_candidates = num_candidates.max(retained.len());
        let increment = logsumexp(&weights) - (num_candidates as f64).ln();
        let previous_evidence = self.log_evidence();
        let log_evidence = logaddexp(previous_evidence, increment);

        self.cutoffs.push(next);
        self.log_weights.push(weights.into());
        self.log_evidence.push(log_evidence);

        Ok(LedgerUpdate {
            cutoff: next,
            log_evidence,
            log_evidence_increment: log_evidence - previous_evidence,
            num_retained: retained.len(),
        })
    }

    /// The current likelihood cutoff.
    pub fn cutoff(&self) -> f64 {
        *self
            .cutoffs
            .last()
            .expect("The ledger always holds the initial cutoff")
    }

    /// The current estimate of the log evidence.
    pub fn log_evidence(&self) -> f64 {
        *self
            .log_evidence
            .last()
            .expect("The ledger always holds the initial evidence")
    }

    /// Number of completed iterations, not counting initialization.
    pub fn num_iterations(&self) -> usize {
        self.cutoffs.len() - 1
    }

    pub fn cutoffs(&self) -> &[f64] {
        &self.cutoffs
    }

    pub fn log_evidence_history(&self) -> &[f64] {
        &self.log_evidence
    }

    /// The log importance weights recorded at `iteration`.
    pub fn log_weights(&self, iteration: usize) -> Option<&[f64]> {
        self.log_weights.get(iteration).map(|weights| &weights[..])
    }

    /// The log importance weights of the current population.
    pub fn last_log_weights(&self) -> &[f64] {
        self.log_weights
            .last()
            .expect("The ledger always holds the initial weights")
    }
}
