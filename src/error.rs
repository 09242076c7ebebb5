use thiserror::Error;

use crate::flow::FlowError;
use crate::var_info::VarInfoError;

/// Errors that abort a nested sampling chain.
///
/// Every variant that can happen after initialization carries the chain and
/// iteration index so that callers can decide whether to restart the chain
/// with a different seed.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NfnsError {
    #[error("Invalid sampler configuration: {0}")]
    Configuration(String),

    #[error("Could not draw the initial population from the prior of chain {chain}")]
    PriorSampling {
        chain: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "Model evaluation failed in chain {chain} at iteration {iteration} for position \
         {position:?} (cutoff {cutoff}, population size {population_size})"
    )]
    ModelEvaluation {
        chain: u64,
        iteration: u64,
        cutoff: f64,
        population_size: usize,
        position: Box<[f64]>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(
        "Training the density transform failed in chain {chain} at iteration {iteration} \
         (cutoff {cutoff}, population size {population_size})"
    )]
    FlowTraining {
        chain: u64,
        iteration: u64,
        cutoff: f64,
        population_size: usize,
        #[source]
        source: FlowError,
    },

    #[error(
        "No candidate exceeded the likelihood cutoff {cutoff} in chain {chain} at iteration \
         {iteration} ({num_candidates} candidates)"
    )]
    EmptyPopulation {
        chain: u64,
        iteration: u64,
        cutoff: f64,
        num_candidates: usize,
    },

    #[error(
        "Likelihood cutoff decreased from {previous} to {next} in chain {chain} at iteration \
         {iteration} (population size {population_size})"
    )]
    InvariantViolation {
        chain: u64,
        iteration: u64,
        previous: f64,
        next: f64,
        population_size: usize,
    },

    #[error("Could not map between structured and flat parameters")]
    VarInfo(#[from] VarInfoError),
}

impl NfnsError {
    /// Whether restarting the chain with a different seed or tempering
    /// coefficient can help.
    ///
    /// Configuration errors, model failures and invariant violations will
    /// happen again on a restart.
    pub fn is_recoverable_by_caller(&self) -> bool {
        matches!(
            self,
            NfnsError::EmptyPopulation { .. }
                | NfnsError::FlowTraining {
                    source: FlowError::NonFiniteLoss { .. },
                    ..
                }
        )
    }
}

/// A non-finite log density returned by a likelihood oracle.
#[derive(Error, Debug)]
#[error("Model returned non-finite log densities (prior {prior_logp}, likelihood {likelihood_logp})")]
pub struct NonFiniteDensity {
    pub prior_logp: f64,
    pub likelihood_logp: f64,
}

pub type Result<T> = std::result::Result<T, NfnsError>;
