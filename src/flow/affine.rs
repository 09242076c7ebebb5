use faer::{Mat, Scale};
use itertools::{izip, Itertools};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use super::{
    check_batch, split_validation, Adam, AdamOptions, DensityTransform, FitReport, FlowError,
    FlowSettings,
};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;
const MIN_VARIANCE: f64 = 1e-12;
const COV_JITTER: f64 = 1e-10;

/// Gaussian base distribution pushed through an affine bijection.
///
/// The bijection is `x = mean + U (shift + exp(log_scale) * z)` where `U`
/// holds the eigenvectors of the sample covariance. `U` and `mean` are fixed
/// from the training data, `shift` and `log_scale` are trained with Adam
/// starting from the moment estimates.
#[derive(Debug, Clone)]
pub struct AffineFlow {
    fitted: Option<AffineParams>,
    arch: pulp::Arch,
}

#[derive(Debug, Clone)]
struct AffineParams {
    mean: Vec<f64>,
    rotation: Mat<f64>,
    shift: Vec<f64>,
    log_scale: Vec<f64>,
}

impl Default for AffineFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl AffineFlow {
    pub fn new() -> Self {
        Self {
            fitted: None,
            arch: pulp::Arch::new(),
        }
    }

    /// Dimension of the fitted density, `None` before the first fit.
    pub fn dim(&self) -> Option<usize> {
        self.fitted.as_ref().map(|params| params.mean.len())
    }

    /// The mean of the fitted density.
    pub fn mean(&self) -> Option<Vec<f64>> {
        let params = self.fitted.as_ref()?;
        let mut out = vec![0f64; params.mean.len()];
        params.push_forward(&vec![0f64; params.mean.len()], &mut out);
        Some(out)
    }
}

impl AffineParams {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Map a base sample `z` to the data space.
    fn push_forward(&self, z: &[f64], out: &mut [f64]) {
        let y = izip!(z, &self.shift, &self.log_scale)
            .map(|(z, shift, log_scale)| shift + log_scale.exp() * z)
            .collect_vec();
        for (j, out) in out.iter_mut().enumerate() {
            *out = self.mean[j]
                + y.iter()
                    .enumerate()
                    .map(|(k, y)| self.rotation[(j, k)] * y)
                    .sum::<f64>();
        }
    }

    /// Coordinates of `x - mean` in the eigenbasis.
    fn rotate(&self, x: &[f64]) -> Vec<f64> {
        (0..self.dim())
            .map(|k| {
                (0..self.dim())
                    .map(|j| self.rotation[(j, k)] * (x[j] - self.mean[j]))
                    .sum()
            })
            .collect()
    }

    fn log_prob(&self, x: &[f64]) -> f64 {
        let y = self.rotate(x);
        let mut logp = -(self.dim() as f64) * LN_SQRT_2PI;
        for (y, shift, log_scale) in izip!(&y, &self.shift, &self.log_scale) {
            let z = (y - shift) * (-log_scale).exp();
            logp -= 0.5 * z * z + log_scale;
        }
        logp
    }
}

/// Negative mean log density of the selected rotated samples and its
/// gradient with respect to `params = [shift, log_scale]`.
fn batch_loss(
    arch: pulp::Arch,
    rotated: &[Vec<f64>],
    batch: &[usize],
    params: &[f64],
    grad: &mut [f64],
) -> f64 {
    arch.dispatch(|| {
        let dim = params.len() / 2;
        let (shift, log_scale) = params.split_at(dim);
        let (grad_shift, grad_log_scale) = grad.split_at_mut(dim);
        grad_shift.fill(0.);
        grad_log_scale.fill(0.);
        let inv_scale = log_scale.iter().map(|s| (-s).exp()).collect_vec();

        let mut quad = 0f64;
        for &idx in batch {
            for (y, shift, inv_scale, g_shift, g_scale) in izip!(
                &rotated[idx],
                shift,
                &inv_scale,
                grad_shift.iter_mut(),
                grad_log_scale.iter_mut()
            ) {
                let z = (y - shift) * inv_scale;
                quad += 0.5 * z * z;
                *g_shift -= z * inv_scale;
                *g_scale -= z * z;
            }
        }

        let count = batch.len() as f64;
        grad_shift.iter_mut().for_each(|g| *g /= count);
        grad_log_scale.iter_mut().for_each(|g| *g = 1. + *g / count);
        quad / count + log_scale.iter().sum::<f64>() + (dim as f64) * LN_SQRT_2PI
    })
}

impl DensityTransform for AffineFlow {
    fn fit<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        samples: &[Box<[f64]>],
        settings: &FlowSettings,
    ) -> Result<FitReport, FlowError> {
        let dim = check_batch(samples)?;
        let (train, validate) = split_validation(samples, settings.frac_validate);
        let ntrain = train.len();

        let mean = (0..dim)
            .map(|i| train.iter().map(|x| x[i]).sum::<f64>() / (ntrain as f64))
            .collect_vec();
        let centered: Mat<f64> = Mat::from_fn(dim, ntrain, |i, k| train[k][i] - mean[i]);
        let mut cov = (&centered) * centered.transpose();
        cov *= Scale(((ntrain.max(2) - 1) as f64).recip());
        let trace = (0..dim).map(|i| cov[(i, i)]).sum::<f64>();
        for i in 0..dim {
            cov[(i, i)] += COV_JITTER * (1. + trace / (dim as f64));
        }

        let eig = cov
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|_| FlowError::Decomposition)?;
        let rotation = eig.U().to_owned();
        let variances = eig.S().column_vector().to_owned();

        let mut params = vec![0f64; 2 * dim];
        for k in 0..dim {
            params[dim + k] = 0.5 * variances[k].max(MIN_VARIANCE).ln();
        }

        let mut fitted = AffineParams {
            mean,
            rotation,
            shift: vec![0f64; dim],
            log_scale: params[dim..].to_vec(),
        };
        let rotated = train.iter().map(|x| fitted.rotate(x)).collect_vec();

        let options = AdamOptions {
            learning_rate: settings.learning_rate,
            ..Default::default()
        };
        let mut adam = Adam::new(options, 2 * dim);
        let mut grad = vec![0f64; 2 * dim];
        let full_batch = (0..ntrain).collect_vec();
        let mut batch = Vec::new();

        for epoch in 0..settings.epochs {
            for step in 0..settings.steps_per_epoch {
                let indices = match settings.batch_size {
                    Some(size) if size < ntrain => {
                        batch.clear();
                        batch.extend((0..size.max(1)).map(|_| rng.random_range(0..ntrain)));
                        &batch
                    }
                    _ => &full_batch,
                };
                let loss = batch_loss(self.arch, &rotated, indices, &params, &mut grad);
                if !loss.is_finite() {
                    return Err(FlowError::NonFiniteLoss { epoch, step, loss });
                }
                adam.step(&mut params, &grad);
            }
        }

        let train_loss = batch_loss(self.arch, &rotated, &full_batch, &params, &mut grad);
        if !train_loss.is_finite() {
            return Err(FlowError::NonFiniteLoss {
                epoch: settings.epochs,
                step: 0,
                loss: train_loss,
            });
        }

        fitted.shift.copy_from_slice(&params[..dim]);
        fitted.log_scale.copy_from_slice(&params[dim..]);

        let validation_loss = if validate.is_empty() {
            None
        } else {
            let total: f64 = validate.iter().map(|x| -fitted.log_prob(x)).sum();
            Some(total / (validate.len() as f64))
        };

        debug!(
            dim,
            num_train = ntrain,
            num_validate = validate.len(),
            train_loss,
            ?validation_loss,
            "Fitted affine flow"
        );

        self.fitted = Some(fitted);
        Ok(FitReport {
            steps: adam.num_steps() as usize,
            train_loss,
            validation_loss,
        })
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<Vec<Box<[f64]>>, FlowError> {
        let params = self.fitted.as_ref().ok_or(FlowError::NotFitted)?;
        let dim = params.dim();
        let mut z = vec![0f64; dim];
        Ok((0..n)
            .map(|_| {
                z.iter_mut().for_each(|z| *z = rng.sample(StandardNormal));
                let mut out = vec![0f64; dim];
                params.push_forward(&z, &mut out);
                out.into()
            })
            .collect())
    }

    fn log_prob(&self, samples: &[Box<[f64]>]) -> Result<Vec<f64>, FlowError> {
        let params = self.fitted.as_ref().ok_or(FlowError::NotFitted)?;
        samples
            .iter()
            .map(|x| {
                if x.len() != params.dim() {
                    return Err(FlowError::DimensionMismatch {
                        expected: params.dim(),
                        found: x.len(),
                    });
                }
                Ok(params.log_prob(x))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Draws from a correlated 2d normal with mean (1, -2).
    fn correlated_draws(rng: &mut ChaCha8Rng, n: usize) -> Vec<Box<[f64]>> {
        (0..n)
            .map(|_| {
                let a: f64 = rng.sample(StandardNormal);
                let b: f64 = rng.sample(StandardNormal);
                vec![1. + 2. * a, -2. + 0.5 * a + 0.5 * b].into()
            })
            .collect()
    }

    fn moments(draws: &[Box<[f64]>]) -> (Vec<f64>, [[f64; 2]; 2]) {
        let n = draws.len() as f64;
        let mean = (0..2)
            .map(|i| draws.iter().map(|x| x[i]).sum::<f64>() / n)
            .collect_vec();
        let mut cov = [[0f64; 2]; 2];
        for x in draws {
            for i in 0..2 {
                for j in 0..2 {
                    cov[i][j] += (x[i] - mean[i]) * (x[j] - mean[j]) / n;
                }
            }
        }
        (mean, cov)
    }

    #[test]
    fn recovers_moments() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let draws = correlated_draws(&mut rng, 4000);

        let mut flow = AffineFlow::new();
        let report = flow
            .fit(&mut rng, &draws, &FlowSettings::default())
            .unwrap();
        assert_eq!(report.steps, 200);
        assert!(report.train_loss.is_finite());
        assert!(report.validation_loss.is_some());
        assert_eq!(flow.dim(), Some(2));

        let fitted_mean = flow.mean().unwrap();
        assert_abs_diff_eq!(fitted_mean[0], 1., epsilon = 0.15);
        assert_abs_diff_eq!(fitted_mean[1], -2., epsilon = 0.15);

        let samples = flow.sample(&mut rng, 4000).unwrap();
        let (mean, cov) = moments(&samples);
        assert_abs_diff_eq!(mean[0], 1., epsilon = 0.2);
        assert_abs_diff_eq!(mean[1], -2., epsilon = 0.2);
        assert_abs_diff_eq!(cov[0][0], 4., epsilon = 0.5);
        assert_abs_diff_eq!(cov[0][1], 1., epsilon = 0.2);
        assert_abs_diff_eq!(cov[1][1], 0.5, epsilon = 0.1);
    }

    #[test]
    fn log_prob_matches_normal() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let draws: Vec<Box<[f64]>> = (0..5000)
            .map(|_| {
                let z: f64 = rng.sample(StandardNormal);
                vec![3. + 0.5 * z].into()
            })
            .collect();
        let mut flow = AffineFlow::new();
        flow.fit(&mut rng, &draws, &FlowSettings::default()).unwrap();

        let logp = flow.log_prob(&[vec![3.].into()]).unwrap();
        let expected = -LN_SQRT_2PI - 0.5f64.ln();
        assert_abs_diff_eq!(logp[0], expected, epsilon = 0.05);

        assert!(matches!(
            flow.log_prob(&[vec![1., 2.].into()]),
            Err(FlowError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn mini_batches() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let draws = correlated_draws(&mut rng, 500);
        let settings = FlowSettings {
            batch_size: Some(64),
            epochs: 5,
            steps_per_epoch: 4,
            ..Default::default()
        };
        let mut flow = AffineFlow::new();
        let report = flow.fit(&mut rng, &draws, &settings).unwrap();
        assert_eq!(report.steps, 20);
        assert!(report.train_loss.is_finite());
    }

    #[test]
    fn errors() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut flow = AffineFlow::new();
        assert!(matches!(
            flow.sample(&mut rng, 3),
            Err(FlowError::NotFitted)
        ));
        assert!(matches!(
            flow.fit(&mut rng, &[], &FlowSettings::default()),
            Err(FlowError::EmptyBatch)
        ));
    }

    #[test]
    fn divergence_is_reported() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let draws = correlated_draws(&mut rng, 100);
        let settings = FlowSettings {
            learning_rate: f64::INFINITY,
            epochs: 1,
            steps_per_epoch: 3,
            ..Default::default()
        };
        let mut flow = AffineFlow::new();
        let err = flow.fit(&mut rng, &draws, &settings).unwrap_err();
        assert!(matches!(err, FlowError::NonFiniteLoss { epoch: 0, .. }));
        assert!(flow.dim().is_none());
    }

    #[test]
    fn single_sample() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut flow = AffineFlow::new();
        flow.fit(&mut rng, &[vec![1., 2.].into()], &FlowSettings::default())
            .unwrap();
        let samples = flow.sample(&mut rng, 10).unwrap();
        assert_eq!(samples.len(), 10);
        assert!(samples.iter().all(|x| x.iter().all(|v| v.is_finite())));
    }
}
