//! Conversion of finished chains into named, structured output.

use anyhow::Result;

mod arrow;
mod points;

pub use arrow::{ArrowPosterior, ArrowTrace};
pub use points::{PointTrace, WeightedPoint};

use crate::posterior::NestedPosterior;
use crate::sampler::Trace;

/// Reshape the terminal population of a chain into an output format.
///
/// Implementations produce one record per particle and keep the particle
/// order of the population.
pub trait TraceExporter {
    type Output;

    fn export(&self, posterior: &NestedPosterior) -> Result<Self::Output>;

    /// Export every successful chain of a trace, in chain order.
    fn export_all(&self, trace: &Trace) -> Result<Vec<Self::Output>> {
        trace
            .chains
            .iter()
            .map(|posterior| self.export(posterior))
            .collect()
    }
}
