use anyhow::{Context, Result};
use itertools::izip;

use super::TraceExporter;
use crate::posterior::NestedPosterior;
use crate::var_info::Point;

/// A folded particle with its log densities.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPoint {
    pub point: Point,
    pub prior_logp: f64,
    pub likelihood_logp: f64,
    pub log_weight: f64,
}

/// Exports each particle as a [`Point`] of `ndarray` arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointTrace;

impl TraceExporter for PointTrace {
    type Output = Vec<WeightedPoint>;

    fn export(&self, posterior: &NestedPosterior) -> Result<Self::Output> {
        let var_info = posterior.var_info();
        izip!(posterior.particles(), posterior.log_weights())
            .map(|(particle, &log_weight)| {
                let point = var_info.fold(particle.position()).with_context(|| {
                    format!("Could not fold particle of chain {}", posterior.chain())
                })?;
                Ok(WeightedPoint {
                    point,
                    prior_logp: particle.prior_logp(),
                    likelihood_logp: particle.likelihood_logp(),
                    log_weight,
                })
            })
            .collect()
    }
}
