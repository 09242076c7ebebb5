use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    error::{NfnsError, Result},
    flow::{DensityTransform, FlowError},
    ledger::ThresholdLedger,
    model::{LikelihoodOracle, Model},
    population::{EvaluationContext, Population},
    posterior::NestedPosterior,
    sampler::NestedSettings,
    var_info::VarInfo,
};

/// Acceptance rates below this value are reported as a warning.
const LOW_ACCEPTANCE_RATE: f64 = 0.05;

/// Diagnostic information about one finished iteration of a chain.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct IterationStats {
    pub chain: u64,
    pub iteration: u64,
    /// The likelihood cutoff after this iteration.
    pub cutoff: f64,
    pub log_evidence: f64,
    pub log_evidence_increment: f64,
    pub num_candidates: usize,
    pub num_retained: usize,
    pub acceptance_rate: f64,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
    pub duration: Duration,
}

/// A single nested sampling chain.
///
/// Each iteration fits the density transform to the live population, draws
/// `draws` candidates from it, evaluates them and keeps those whose log
/// likelihood is strictly above the current cutoff. The surviving candidates
/// replace the population and the ledger moves the cutoff up to their
/// smallest log likelihood.
pub struct NestedChain<O, T, R>
where
    O: LikelihoodOracle,
    T: DensityTransform,
    R: Rng,
{
    oracle: O,
    transform: T,
    rng: R,
    var_info: VarInfo,
    population: Population,
    ledger: ThresholdLedger,
    history: Vec<IterationStats>,
    settings: NestedSettings,
    chain: u64,
    iteration: u64,
    converged: bool,
}

impl<O, T, R> NestedChain<O, T, R>
where
    O: LikelihoodOracle,
    T: DensityTransform,
    R: Rng,
{
    /// Draw the initial population from the prior of `model` and evaluate it.
    ///
    /// This is iteration 0 of the chain. The variable layout is taken from
    /// the initial point of the model.
    pub fn initialize<M: Model + ?Sized>(
        model: &M,
        oracle: O,
        transform: T,
        settings: &NestedSettings,
        chain: u64,
        mut rng: R,
    ) -> Result<Self> {
        settings.validate()?;

        let initial_point = model
            .initial_point()
            .map_err(|source| NfnsError::PriorSampling { chain, source })?;
        let var_info = VarInfo::from_point(&initial_point)?;
        if var_info.dim() != oracle.dim() {
            return Err(NfnsError::Configuration(format!(
                "The model variables have {} entries, but the likelihood expects {}",
                var_info.dim(),
                oracle.dim()
            )));
        }

        let names: Vec<&str> = var_info.names().collect();
        let points = model
            .sample_prior(&mut rng, settings.draws, &names)
            .map_err(|source| NfnsError::PriorSampling { chain, source })?;
        if points.len() != settings.draws {
            return Err(NfnsError::PriorSampling {
                chain,
                source: anyhow::anyhow!(
                    "Expected {} prior draws, got {}",
                    settings.draws,
                    points.len()
                ),
            });
        }
        let positions = points
            .iter()
            .map(|point| var_info.flatten(point))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let population = Population::evaluate(
            &oracle,
            positions,
            settings.parallel_evaluation,
            EvaluationContext::initialization(chain),
        )?;
        let ledger = ThresholdLedger::new(chain, &population, settings.beta)?;

        info!(
            chain,
            draws = settings.draws,
            dim = var_info.dim(),
            cutoff = ledger.cutoff(),
            "Initialized population from the prior"
        );

        Ok(Self {
            oracle,
            transform,
            rng,
            var_info,
            population,
            ledger,
            history: Vec::new(),
            settings: settings.clone(),
            chain,
            iteration: 0,
            converged: false,
        })
    }

    /// Run one iteration.
    ///
    /// On error the population and the ledger keep their previous state.
    pub fn step(&mut self) -> Result<IterationStats> {
        let start = Instant::now();
        let chain = self.chain;
        let iteration = self.iteration + 1;
        let draws = self.settings.draws;
        let population_size = self.population.len();
        let cutoff = self.ledger.cutoff();
        let training_error = |source: FlowError| NfnsError::FlowTraining {
            chain,
            iteration,
            cutoff,
            population_size,
            source,
        };

        let samples = self.population.to_positions();
        let report = self
            .transform
            .fit(&mut self.rng, &samples, &self.settings.flow)
            .map_err(training_error)?;
        debug!(
            chain,
            iteration,
            population_size,
            train_loss = report.train_loss,
            validation_loss = ?report.validation_loss,
            "Fitted density transform"
        );

        let candidates = self
            .transform
            .sample(&mut self.rng, draws)
            .map_err(training_error)?;
        if candidates.len() != draws {
            return Err(training_error(FlowError::SampleCount {
                expected: draws,
                found: candidates.len(),
            }));
        }
        let dim = self.var_info.dim();
        if let Some(bad) = candidates.iter().find(|candidate| candidate.len() != dim) {
            return Err(training_error(FlowError::DimensionMismatch {
                expected: dim,
                found: bad.len(),
            }));
        }

        let mut population = Population::evaluate(
            &self.oracle,
            candidates,
            self.settings.parallel_evaluation,
            EvaluationContext {
                chain,
                iteration,
                cutoff,
                population_size,
            },
        )?;
        population.retain_above(cutoff);
        debug!(
            chain,
            iteration,
            cutoff,
            num_retained = population.len(),
            "Filtered candidates"
        );

        let update = self
            .ledger
            .advance(chain, iteration, &population, self.settings.beta, draws)?;
        self.population = population;
        self.iteration = iteration;

        let acceptance_rate = update.num_retained as f64 / draws as f64;
        if acceptance_rate < LOW_ACCEPTANCE_RATE {
            warn!(
                chain,
                iteration,
                acceptance_rate,
                num_retained = update.num_retained,
                "Few candidates passed the likelihood cutoff"
            );
        }
        if let Some(tolerance) = self.settings.evidence_tolerance {
            if update.log_evidence_increment < tolerance {
                self.converged = true;
            }
        }

        let stats = IterationStats {
            chain,
            iteration,
            cutoff: update.cutoff,
            log_evidence: update.log_evidence,
            log_evidence_increment: update.log_evidence_increment,
            num_candidates: draws,
            num_retained: update.num_retained,
            acceptance_rate,
            train_loss: report.train_loss,
            validation_loss: report.validation_loss,
            duration: start.elapsed(),
        };
        info!(
            chain,
            iteration,
            cutoff = stats.cutoff,
            log_evidence = stats.log_evidence,
            acceptance_rate,
            "Finished iteration"
        );
        self.history.push(stats.clone());
        Ok(stats)
    }

    /// Run iterations until the step budget is used up or the evidence has
    /// converged.
    pub fn run(&mut self) -> Result<()> {
        while !self.is_finished() {
            self.step()?;
        }
        if self.converged {
            info!(
                chain = self.chain,
                iteration = self.iteration,
                log_evidence = self.ledger.log_evidence(),
                "Evidence estimate converged"
            );
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.converged || self.iteration >= self.settings.n_steps
    }

    /// Whether the chain stopped because the evidence increment fell below
    /// the tolerance.
    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    /// Number of finished iterations, not counting initialization.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn ledger(&self) -> &ThresholdLedger {
        &self.ledger
    }

    pub fn var_info(&self) -> &VarInfo {
        &self.var_info
    }

    pub fn history(&self) -> &[IterationStats] {
        &self.history
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Stop the chain and keep the weighted terminal population.
    pub fn into_posterior(self) -> NestedPosterior {
        NestedPosterior::new(
            self.chain,
            self.var_info,
            self.population,
            self.ledger,
            self.history,
            self.settings.k_trunc,
        )
    }
}
