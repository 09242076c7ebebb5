//! A likelihood oracle for simulation based inference.
//!
//! Instead of an analytic likelihood, [`PseudoLikelihood`] runs a simulator
//! with the current parameters, summarizes simulated and observed data, and
//! scores the summaries with a distance kernel of width `epsilon`.

use std::sync::Mutex;

use itertools::{izip, Itertools};
use thiserror::Error;

use crate::model::{LikelihoodOracle, LogDensities};
use crate::var_info::{Point, VarInfo, VarInfoError};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PseudoLikelihoodError {
    #[error("Could not evaluate the prior density")]
    Prior(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("The simulator failed")]
    Simulator(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Simulated summary has length {found}, observed summary has length {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Simulator parameter {0} is not a model variable")]
    MissingParameter(String),
    #[error("epsilon must be positive and finite, got {0}")]
    InvalidEpsilon(f64),
    #[error("The number of saved simulations must be positive")]
    InvalidSize,
    #[error(transparent)]
    VarInfo(#[from] VarInfoError),
}

/// Elementwise log kernel between observed and simulated summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    /// `-0.5 * ((observed - simulated) / epsilon)^2`
    #[default]
    Gaussian,
    /// `-|observed - simulated| / epsilon`
    Laplace,
}

impl Distance {
    pub fn elementwise(self, epsilon: f64, observed: &[f64], simulated: &[f64]) -> Vec<f64> {
        izip!(observed, simulated)
            .map(|(obs, sim)| {
                let scaled = (obs - sim) / epsilon;
                match self {
                    Distance::Gaussian => -0.5 * scaled * scaled,
                    Distance::Laplace => -scaled.abs(),
                }
            })
            .collect()
    }
}

/// Summary statistic applied to observed and simulated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryStatistic {
    #[default]
    Identity,
    Sorted,
    Mean,
    Median,
    /// Population variance.
    Variance,
}

impl SummaryStatistic {
    pub fn apply(self, data: &[f64]) -> Vec<f64> {
        let n = data.len() as f64;
        let mean = || data.iter().sum::<f64>() / n;
        match self {
            SummaryStatistic::Identity => data.to_vec(),
            SummaryStatistic::Sorted => data.iter().copied().sorted_by(f64::total_cmp).collect(),
            SummaryStatistic::Mean => vec![mean()],
            SummaryStatistic::Median => {
                let sorted = data.iter().copied().sorted_by(f64::total_cmp).collect_vec();
                let mid = sorted.len() / 2;
                let median = match sorted.len() {
                    0 => f64::NAN,
                    len if len % 2 == 0 => 0.5 * (sorted[mid - 1] + sorted[mid]),
                    _ => sorted[mid],
                };
                vec![median]
            }
            SummaryStatistic::Variance => {
                let mean = mean();
                vec![data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n]
            }
        }
    }
}

/// Settings for [`PseudoLikelihood`]
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoLikelihoodSettings {
    /// Width of the distance kernel.
    pub epsilon: f64,
    /// Names of the model variables that are passed to the simulator.
    pub params: Vec<String>,
    pub distance: Distance,
    pub sum_stat: SummaryStatistic,
    /// Number of entries kept in each buffer. A full buffer is cleared before
    /// the next entry is stored.
    pub size: usize,
    /// Keep the raw output of the simulator.
    pub save_sim_data: bool,
    /// Keep the elementwise log pseudo-likelihood.
    pub save_log_pseudolikelihood: bool,
}

impl Default for PseudoLikelihoodSettings {
    fn default() -> Self {
        Self {
            epsilon: 1.,
            params: Vec::new(),
            distance: Distance::default(),
            sum_stat: SummaryStatistic::default(),
            size: 1000,
            save_sim_data: false,
            save_log_pseudolikelihood: false,
        }
    }
}

/// Likelihood oracle that compares simulated with observed data.
///
/// The prior term comes from `prior`, an oracle for the same parameter
/// vector. Its likelihood term is ignored.
pub struct PseudoLikelihood<O, F> {
    prior: O,
    simulator: F,
    var_info: VarInfo,
    observed: Vec<f64>,
    settings: PseudoLikelihoodSettings,
    sim_data: Mutex<Vec<Vec<f64>>>,
    log_pseudolikelihood: Mutex<Vec<Vec<f64>>>,
}

impl<O, F> PseudoLikelihood<O, F>
where
    O: LikelihoodOracle,
    F: Fn(&Point) -> anyhow::Result<Vec<f64>> + Sync,
{
    pub fn new(
        prior: O,
        simulator: F,
        var_info: VarInfo,
        observations: &[f64],
        settings: PseudoLikelihoodSettings,
    ) -> Result<Self, PseudoLikelihoodError> {
        if !(settings.epsilon.is_finite() && settings.epsilon > 0.) {
            return Err(PseudoLikelihoodError::InvalidEpsilon(settings.epsilon));
        }
        if settings.size == 0 {
            return Err(PseudoLikelihoodError::InvalidSize);
        }
        if let Some(missing) = settings
            .params
            .iter()
            .find(|param| !var_info.names().any(|name| name == param.as_str()))
        {
            return Err(PseudoLikelihoodError::MissingParameter(missing.clone()));
        }
        if prior.dim() != var_info.dim() {
            return Err(VarInfoError::LengthMismatch {
                expected: var_info.dim(),
                found: prior.dim(),
            }
            .into());
        }
        let observed = settings.sum_stat.apply(observations);
        Ok(Self {
            prior,
            simulator,
            var_info,
            observed,
            settings,
            sim_data: Mutex::new(Vec::new()),
            log_pseudolikelihood: Mutex::new(Vec::new()),
        })
    }

    /// The summary of the observed data.
    pub fn observed_summary(&self) -> &[f64] {
        &self.observed
    }

    /// The simulator parameters of a flat parameter vector.
    pub fn simulator_parameters(&self, position: &[f64]) -> Result<Point, VarInfoError> {
        Ok(self
            .var_info
            .fold(position)?
            .iter()
            .filter(|(name, _)| {
                self.settings
                    .params
                    .iter()
                    .any(|param| param.as_str() == *name)
            })
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect())
    }

    /// Saved simulator outputs, oldest first.
    pub fn sim_data(&self) -> Vec<Vec<f64>> {
        self.sim_data.lock().expect("Poisoned lock").clone()
    }

    /// Saved elementwise log pseudo-likelihoods, oldest first.
    pub fn log_pseudolikelihoods(&self) -> Vec<Vec<f64>> {
        self.log_pseudolikelihood
            .lock()
            .expect("Poisoned lock")
            .clone()
    }

    fn save(&self, buffer: &Mutex<Vec<Vec<f64>>>, values: Vec<f64>) {
        let mut buffer = buffer.lock().expect("Poisoned lock");
        if buffer.len() == self.settings.size {
            buffer.clear();
        }
        buffer.push(values);
    }
}

impl<O, F> LikelihoodOracle for PseudoLikelihood<O, F>
where
    O: LikelihoodOracle,
    F: Fn(&Point) -> anyhow::Result<Vec<f64>> + Sync,
{
    type Err = PseudoLikelihoodError;

    fn dim(&self) -> usize {
        self.var_info.dim()
    }

    fn evaluate(&self, position: &[f64]) -> Result<LogDensities, PseudoLikelihoodError> {
        let prior_logp = self
            .prior
            .evaluate(position)
            .map_err(|err| PseudoLikelihoodError::Prior(Box::new(err)))?
            .prior_logp;

        let params = self.simulator_parameters(position)?;
        let simulated =
            (self.simulator)(&params).map_err(|err| PseudoLikelihoodError::Simulator(err.into()))?;
        let summary = self.settings.sum_stat.apply(&simulated);
        if summary.len() != self.observed.len() {
            return Err(PseudoLikelihoodError::LengthMismatch {
                expected: self.observed.len(),
                found: summary.len(),
            });
        }
        if self.settings.save_sim_data {
            self.save(&self.sim_data, simulated);
        }

        let elementwise =
            self.settings
                .distance
                .elementwise(self.settings.epsilon, &self.observed, &summary);
        let likelihood_logp = elementwise.iter().sum();
        if self.settings.save_log_pseudolikelihood {
            self.save(&self.log_pseudolikelihood, elementwise);
        }
        Ok(LogDensities::new(prior_logp, likelihood_logp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::NestedChain;
    use crate::flow::AffineFlow;
    use crate::model::test_models::NormalModel;
    use crate::model::Model;
    use crate::sampler::NestedSettings;
    use anyhow::Result;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn prior() -> NormalModel {
        NormalModel {
            dim: 1,
            mu: 0.,
            sigma: 1.,
        }
    }

    fn var_info(model: &NormalModel) -> VarInfo {
        VarInfo::from_point(&model.initial_point().unwrap()).unwrap()
    }

    /// Three noiseless observations of the parameter.
    fn repeat(point: &Point) -> Result<Vec<f64>> {
        let x = point
            .get("x")
            .ok_or_else(|| anyhow::anyhow!("x is missing"))?;
        Ok(vec![x[0]; 3])
    }

    fn settings() -> PseudoLikelihoodSettings {
        PseudoLikelihoodSettings {
            params: vec!["x".into()],
            ..Default::default()
        }
    }

    #[test]
    fn summary_statistics() {
        let data = [3., 1., 4., 1.5];
        assert_eq!(SummaryStatistic::Identity.apply(&data), data.to_vec());
        assert_eq!(SummaryStatistic::Sorted.apply(&data), vec![1., 1.5, 3., 4.]);
        assert_eq!(SummaryStatistic::Mean.apply(&data), vec![2.375]);
        assert_eq!(SummaryStatistic::Median.apply(&data), vec![2.25]);
        assert_eq!(SummaryStatistic::Median.apply(&data[..3]), vec![3.]);
        assert_abs_diff_eq!(
            SummaryStatistic::Variance.apply(&data)[0],
            1.421875,
            epsilon = 1e-12
        );
    }

    #[test]
    fn distances() {
        let gaussian = Distance::Gaussian.elementwise(2., &[1., 0.], &[3., 0.]);
        assert_eq!(gaussian, vec![-0.5, 0.]);
        let laplace = Distance::Laplace.elementwise(2., &[1., 0.], &[3., -1.]);
        assert_eq!(laplace, vec![-1., -0.5]);
    }

    #[test]
    fn evaluates_prior_and_distance() {
        let model = prior();
        let oracle =
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[1., 1., 1.], settings())
                .unwrap();
        assert_eq!(oracle.dim(), 1);
        let densities = oracle.evaluate(&[3.]).unwrap();
        let expected_prior = model.evaluate(&[3.]).unwrap().prior_logp;
        assert_eq!(densities.prior_logp, expected_prior);
        assert_eq!(densities.likelihood_logp, -0.5 * 3. * 4.);
    }

    #[test]
    fn buffers_restart_when_full() {
        let model = prior();
        let settings = PseudoLikelihoodSettings {
            size: 2,
            save_sim_data: true,
            save_log_pseudolikelihood: true,
            ..settings()
        };
        let oracle =
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[0., 0., 0.], settings)
                .unwrap();
        for x in [1., 2., 3.] {
            oracle.evaluate(&[x]).unwrap();
        }
        assert_eq!(oracle.sim_data(), vec![vec![3.; 3]]);
        assert_eq!(oracle.log_pseudolikelihoods(), vec![vec![-4.5; 3]]);
    }

    #[test]
    fn construction_errors() {
        let model = prior();
        let missing = PseudoLikelihoodSettings {
            params: vec!["sigma".into()],
            ..Default::default()
        };
        assert!(matches!(
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[0.], missing),
            Err(PseudoLikelihoodError::MissingParameter(name)) if name == "sigma"
        ));

        let bad_epsilon = PseudoLikelihoodSettings {
            epsilon: 0.,
            ..settings()
        };
        assert!(matches!(
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[0.], bad_epsilon),
            Err(PseudoLikelihoodError::InvalidEpsilon(_))
        ));
    }

    #[test]
    fn summary_length_must_match() {
        let model = prior();
        let oracle =
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[0., 0.], settings())
                .unwrap();
        assert!(matches!(
            oracle.evaluate(&[1.]),
            Err(PseudoLikelihoodError::LengthMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn nested_sampling_with_simulator() {
        let model = prior();
        let settings = PseudoLikelihoodSettings {
            epsilon: 0.5,
            sum_stat: SummaryStatistic::Mean,
            ..settings()
        };
        let oracle =
            PseudoLikelihood::new(&model, repeat, var_info(&model), &[1.5, 2., 2.5], settings)
                .unwrap();
        let nested = NestedSettings {
            draws: 200,
            n_steps: 4,
            random_seed: Some(3),
            ..Default::default()
        };
        let mut chain = NestedChain::initialize(
            &model,
            oracle,
            AffineFlow::new(),
            &nested,
            0,
            ChaCha8Rng::seed_from_u64(3),
        )
        .unwrap();
        let initial_min = chain.population().min_likelihood().unwrap();
        chain.run().unwrap();
        assert_eq!(chain.iteration(), 4);

        let cutoffs = chain.ledger().cutoffs();
        assert_eq!(cutoffs.len(), 5);
        assert!(cutoffs.windows(2).all(|pair| pair[1] > pair[0]));
        assert!(chain
            .population()
            .particles()
            .iter()
            .all(|particle| particle.likelihood_logp() > cutoffs[3]));
        assert!(chain.population().min_likelihood().unwrap() > initial_min);
        assert!(chain.ledger().log_evidence().is_finite());
    }
}
