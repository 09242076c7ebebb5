use anyhow::{Context, Result};
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{error, info};

use crate::{
    chain::NestedChain,
    error::NfnsError,
    flow::{DensityTransform, FlowSettings},
    model::Model,
    posterior::NestedPosterior,
};

/// Settings for the nested sampler
#[derive(Debug, Clone, PartialEq)]
pub struct NestedSettings {
    /// Number of particles drawn from the prior, and number of candidates
    /// drawn from the density transform in every iteration.
    pub draws: usize,
    /// Maximum number of iterations after initialization.
    pub n_steps: u64,
    /// Seed of the random generator. `None` draws a seed from the OS.
    pub random_seed: Option<u64>,
    /// Index of the first chain. Chains are numbered consecutively from here.
    pub chain: u64,
    pub num_chains: usize,
    /// Tempering coefficient of the likelihood in the importance weights.
    pub beta: f64,
    /// Hyperparameters handed to the density transform.
    pub flow: FlowSettings,
    /// Evaluate the candidates of an iteration on the rayon thread pool.
    pub parallel_evaluation: bool,
    /// Stop a chain once an iteration increases the log evidence by less
    /// than this.
    pub evidence_tolerance: Option<f64>,
    /// Exponent of the importance weight truncation used for resampling.
    pub k_trunc: f64,
}

impl Default for NestedSettings {
    fn default() -> Self {
        Self {
            draws: 500,
            n_steps: 10,
            random_seed: None,
            chain: 0,
            num_chains: 1,
            beta: 1.,
            flow: FlowSettings::default(),
            parallel_evaluation: true,
            evidence_tolerance: None,
            k_trunc: 0.25,
        }
    }
}

impl NestedSettings {
    pub fn validate(&self) -> std::result::Result<(), NfnsError> {
        let fail = |msg: String| Err(NfnsError::Configuration(msg));
        if self.draws == 0 {
            return fail("draws must be positive".into());
        }
        if self.n_steps == 0 {
            return fail("n_steps must be positive".into());
        }
        if self.num_chains == 0 {
            return fail("num_chains must be positive".into());
        }
        if !(0. ..=1.).contains(&self.beta) {
            return fail(format!("beta must be in [0, 1], got {}", self.beta));
        }
        if self.flow.epochs == 0 || self.flow.steps_per_epoch == 0 {
            return fail("epochs and steps_per_epoch must be positive".into());
        }
        if !(self.flow.learning_rate > 0.) {
            return fail(format!(
                "learning_rate must be positive, got {}",
                self.flow.learning_rate
            ));
        }
        if !(0. ..1.).contains(&self.flow.frac_validate) {
            return fail(format!(
                "frac_validate must be in [0, 1), got {}",
                self.flow.frac_validate
            ));
        }
        if !(self.k_trunc.is_finite() && self.k_trunc >= 0.) {
            return fail(format!("k_trunc must be non-negative, got {}", self.k_trunc));
        }
        if let Some(tolerance) = self.evidence_tolerance {
            if tolerance.is_nan() || tolerance < 0. {
                return fail(format!(
                    "evidence_tolerance must be non-negative, got {tolerance}"
                ));
            }
        }
        Ok(())
    }

    /// The seed shared by all chains.
    pub fn seed(&self) -> u64 {
        self.random_seed.unwrap_or_else(|| rand::rng().random())
    }

    /// The indices of the chains that are sampled.
    pub fn chain_ids(&self) -> impl Iterator<Item = u64> {
        self.chain..self.chain + self.num_chains as u64
    }

    /// Draw the initial population of a new chain.
    ///
    /// The random generator of the chain is `seed` on stream `chain`.
    pub fn new_chain<'model, M: Model, T: DensityTransform>(
        &self,
        model: &'model M,
        transform: T,
        chain: u64,
        seed: u64,
    ) -> Result<NestedChain<M::Oracle<'model>, T, ChaCha8Rng>> {
        let oracle = model.oracle().context("Failed to create model density")?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(chain);
        let chain = NestedChain::initialize(model, oracle, transform, self, chain, rng)?;
        Ok(chain)
    }
}

/// A chain that was aborted by an error.
#[derive(Debug)]
pub struct ChainFailure {
    pub chain: u64,
    pub error: anyhow::Error,
}

impl ChainFailure {
    /// Whether the chain might succeed when restarted with another seed.
    pub fn is_recoverable(&self) -> bool {
        self.error
            .downcast_ref::<NfnsError>()
            .is_some_and(NfnsError::is_recoverable_by_caller)
    }
}

/// The results of all chains, sorted by chain index.
#[derive(Debug, Default)]
pub struct Trace {
    pub chains: Vec<NestedPosterior>,
    pub failures: Vec<ChainFailure>,
}

impl Trace {
    fn from_results(results: Vec<(u64, Result<NestedPosterior>)>) -> Self {
        let mut trace = Trace::default();
        for (chain, result) in results {
            match result {
                Ok(posterior) => trace.chains.push(posterior),
                Err(error) => {
                    error!(chain, error = %error, "Chain failed");
                    trace.failures.push(ChainFailure { chain, error });
                }
            }
        }
        trace.chains.sort_unstable_by_key(|posterior| posterior.chain());
        trace.failures.sort_unstable_by_key(|failure| failure.chain);
        trace
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn run_chain<M, T>(
    model: &M,
    settings: &NestedSettings,
    transform: T,
    chain: u64,
    seed: u64,
) -> Result<NestedPosterior>
where
    M: Model,
    T: DensityTransform,
{
    let mut sampler = settings.new_chain(model, transform, chain, seed)?;
    sampler.run()?;
    info!(
        chain,
        iterations = sampler.iteration(),
        log_evidence = sampler.ledger().log_evidence(),
        "Chain finished"
    );
    Ok(sampler.into_posterior())
}

/// Sample `settings.num_chains` independent chains on a thread pool with
/// `num_cores` threads.
///
/// `make_transform` creates the density transform of each chain from its
/// index. A failing chain does not stop the others; its error is reported in
/// [`Trace::failures`].
pub fn sample_parallel<M, T, F>(
    model: &M,
    settings: &NestedSettings,
    make_transform: F,
    num_cores: usize,
) -> Result<Trace>
where
    M: Model,
    T: DensityTransform,
    F: Fn(u64) -> T + Sync,
{
    settings.validate()?;
    let seed = settings.seed();
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_cores)
        .thread_name(|i| format!("nfns-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let chain_ids = settings.chain_ids().collect_vec();
    let results: Vec<_> = pool.install(|| {
        chain_ids
            .into_par_iter()
            .map(|chain| {
                let result = run_chain(model, settings, make_transform(chain), chain, seed);
                (chain, result)
            })
            .collect()
    });
    Ok(Trace::from_results(results))
}

/// Sample the same chains as [`sample_parallel`] one after the other on the
/// calling thread.
pub fn sample_sequentially<M, T, F>(
    model: &M,
    settings: &NestedSettings,
    make_transform: F,
) -> Result<Trace>
where
    M: Model,
    T: DensityTransform,
    F: Fn(u64) -> T,
{
    settings.validate()?;
    let seed = settings.seed();
    let results = settings
        .chain_ids()
        .map(|chain| {
            let result = run_chain(model, settings, make_transform(chain), chain, seed);
            (chain, result)
        })
        .collect();
    Ok(Trace::from_results(results))
}
