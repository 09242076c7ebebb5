//! Trainable density estimators used to propose new particles.
//!
//! The nested sampler only relies on the [`DensityTransform`] trait. Two
//! estimators ship with the crate:
//!
//! - [`AffineFlow`]: a Gaussian base distribution pushed through an affine
//!   bijection in the eigenbasis of the population covariance, trained with
//!   Adam on the negative log density.
//! - [`KernelDensity`]: a Gaussian kernel density estimate of the population.
//!
//! Normalizing flows with neural conditioners can be plugged in by
//! implementing the trait; the architecture fields of [`FlowSettings`] are
//! meant for them and are ignored by the built-in estimators.

use rand::Rng;
use thiserror::Error;

mod adam;
mod affine;
mod kde;

pub use adam::{Adam, AdamOptions};
pub use affine::AffineFlow;
pub use kde::KernelDensity;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Can not train a density transform on an empty batch")]
    EmptyBatch,
    #[error("Training data contains non-finite values")]
    NonFiniteInput,
    #[error("Training loss became non-finite ({loss}) in epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, loss: f64 },
    #[error("Expected vectors of length {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Requested {expected} samples, got {found}")]
    SampleCount { expected: usize, found: usize },
    #[error("Could not decompose the sample covariance")]
    Decomposition,
    #[error("The density transform has not been fitted")]
    NotFitted,
    #[error("The density transform does not support this operation")]
    Unsupported,
}

/// Nonlinearity of the conditioner networks of neural flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Tanh,
    Relu,
    Elu,
    Gelu,
}

/// Hyperparameters for training a density transform.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    /// Number of bijective layers of a neural flow.
    pub layers: usize,
    /// Hidden layer widths of the conditioner networks of a neural flow.
    pub hidden_shape: Vec<usize>,
    pub activation: Activation,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub learning_rate: f64,
    /// Mini-batch size. `None` trains on the full batch in every step.
    pub batch_size: Option<usize>,
    /// Fraction of the samples that is held out to compute a validation loss.
    pub frac_validate: f64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            layers: 5,
            hidden_shape: vec![100, 100],
            activation: Activation::Tanh,
            epochs: 20,
            steps_per_epoch: 10,
            learning_rate: 0.01,
            batch_size: None,
            frac_validate: 0.1,
        }
    }
}

/// Summary of one call to [`DensityTransform::fit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    /// Number of optimizer steps that were taken.
    pub steps: usize,
    /// Negative mean log density of the training samples after training.
    pub train_loss: f64,
    /// Negative mean log density of the held out samples, if any.
    pub validation_loss: Option<f64>,
}

/// A trainable density estimator that can generate new samples.
///
/// `fit` is called once per iteration with the live population, and `sample`
/// may then be called any number of times. All randomness comes from the
/// generator passed in by the caller.
pub trait DensityTransform: Send {
    /// Train the transform to approximate the density of `samples`.
    ///
    /// Fails with [`FlowError::EmptyBatch`] for an empty slice and with
    /// [`FlowError::NonFiniteLoss`] if training diverges.
    fn fit<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        samples: &[Box<[f64]>],
        settings: &FlowSettings,
    ) -> Result<FitReport, FlowError>;

    /// Draw `n` independent samples from the fitted density.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<Vec<Box<[f64]>>, FlowError>;

    /// Log density of the fitted transform at each sample.
    fn log_prob(&self, _samples: &[Box<[f64]>]) -> Result<Vec<f64>, FlowError> {
        Err(FlowError::Unsupported)
    }
}

/// Check that a batch is non-empty, finite and of consistent length.
///
/// Returns the common length of the vectors.
pub(crate) fn check_batch(samples: &[Box<[f64]>]) -> Result<usize, FlowError> {
    let Some(first) = samples.first() else {
        return Err(FlowError::EmptyBatch);
    };
    let dim = first.len();
    for sample in samples {
        if sample.len() != dim {
            return Err(FlowError::DimensionMismatch {
                expected: dim,
                found: sample.len(),
            });
        }
        if !sample.iter().all(|x| x.is_finite()) {
            return Err(FlowError::NonFiniteInput);
        }
    }
    Ok(dim)
}

/// Split off the trailing `frac_validate` part of the samples for validation.
///
/// At least one sample is always kept for training.
pub(crate) fn split_validation(
    samples: &[Box<[f64]>],
    frac_validate: f64,
) -> (&[Box<[f64]>], &[Box<[f64]>]) {
    let n = samples.len();
    let num_validate = ((n as f64) * frac_validate).floor() as usize;
    let num_validate = num_validate.min(n.saturating_sub(1));
    samples.split_at(n - num_validate)
}
