use itertools::{izip, Itertools};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{check_batch, split_validation, DensityTransform, FitReport, FlowError, FlowSettings};
use crate::math::logsumexp;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;
const MIN_BANDWIDTH: f64 = 1e-8;

/// Gaussian kernel density estimate with a diagonal bandwidth.
///
/// The bandwidth of each coordinate follows Scott's rule, scaled by
/// `bw_factor`. Fitting does not train anything, so the optimizer fields of
/// [`FlowSettings`] are ignored.
#[derive(Debug, Clone)]
pub struct KernelDensity {
    bw_factor: f64,
    centers: Vec<Box<[f64]>>,
    bandwidth: Vec<f64>,
}

impl Default for KernelDensity {
    fn default() -> Self {
        Self::new(1.)
    }
}

impl KernelDensity {
    pub fn new(bw_factor: f64) -> Self {
        Self {
            bw_factor,
            centers: Vec::new(),
            bandwidth: Vec::new(),
        }
    }

    pub fn bandwidth(&self) -> &[f64] {
        &self.bandwidth
    }

    fn log_density(&self, x: &[f64]) -> f64 {
        let norm = self
            .bandwidth
            .iter()
            .map(|h| h.ln() + LN_SQRT_2PI)
            .sum::<f64>();
        let kernels = self
            .centers
            .iter()
            .map(|center| {
                -izip!(x, center.iter(), &self.bandwidth)
                    .map(|(x, c, h)| {
                        let z = (x - c) / h;
                        0.5 * z * z
                    })
                    .sum::<f64>()
            })
            .collect_vec();
        logsumexp(&kernels) - (self.centers.len() as f64).ln() - norm
    }
}

impl DensityTransform for KernelDensity {
    fn fit<R: Rng + ?Sized>(
        &mut self,
        _rng: &mut R,
        samples: &[Box<[f64]>],
        settings: &FlowSettings,
    ) -> Result<FitReport, FlowError> {
        let dim = check_batch(samples)?;
        let (train, validate) = split_validation(samples, settings.frac_validate);
        let n = train.len() as f64;
        let scott = n.powf(-1. / (dim as f64 + 4.));

        self.bandwidth = (0..dim)
            .map(|i| {
                let mean = train.iter().map(|x| x[i]).sum::<f64>() / n;
                let var = train.iter().map(|x| (x[i] - mean).powi(2)).sum::<f64>() / n;
                (self.bw_factor * scott * var.sqrt()).max(MIN_BANDWIDTH)
            })
            .collect();
        self.centers = train.to_vec();

        let mean_nll = |points: &[Box<[f64]>]| {
            points.iter().map(|x| -self.log_density(x)).sum::<f64>() / (points.len() as f64)
        };
        let train_loss = mean_nll(train);
        let validation_loss = (!validate.is_empty()).then(|| mean_nll(validate));

        Ok(FitReport {
            steps: 0,
            train_loss,
            validation_loss,
        })
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<Vec<Box<[f64]>>, FlowError> {
        if self.centers.is_empty() {
            return Err(FlowError::NotFitted);
        }
        Ok((0..n)
            .map(|_| {
                let center = &self.centers[rng.random_range(0..self.centers.len())];
                center
                    .iter()
                    .zip(&self.bandwidth)
                    .map(|(c, h)| c + h * rng.sample::<f64, _>(StandardNormal))
                    .collect()
            })
            .collect())
    }

    fn log_prob(&self, samples: &[Box<[f64]>]) -> Result<Vec<f64>, FlowError> {
        if self.centers.is_empty() {
            return Err(FlowError::NotFitted);
        }
        let dim = self.bandwidth.len();
        samples
            .iter()
            .map(|x| {
                if x.len() != dim {
                    return Err(FlowError::DimensionMismatch {
                        expected: dim,
                        found: x.len(),
                    });
                }
                Ok(self.log_density(x))
            })
            .collect()
    }
}
