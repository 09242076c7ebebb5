//! Nested sampling with trainable density estimators as proposals.
//!
//! A chain starts from `draws` prior samples. In every iteration a
//! [`DensityTransform`] is fitted to the live particles, new candidates are
//! drawn from it, and only candidates whose log likelihood lies strictly above
//! the current cutoff survive. The cutoffs, importance weights and the
//! evidence estimate are kept in a [`ThresholdLedger`].
//!
//! Use [`sample_parallel`] to run independent chains on a thread pool, or
//! [`NestedSettings::new_chain`] to drive a single [`NestedChain`] by hand.

pub(crate) mod chain;
pub(crate) mod error;
pub(crate) mod flow;
pub(crate) mod ledger;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod population;
pub(crate) mod posterior;
pub(crate) mod pseudo_likelihood;
pub(crate) mod sampler;
pub(crate) mod storage;
pub(crate) mod var_info;

pub use chain::{IterationStats, NestedChain};
pub use error::{NfnsError, NonFiniteDensity};
pub use flow::{
    Activation, Adam, AdamOptions, AffineFlow, DensityTransform, FitReport, FlowError,
    FlowSettings, KernelDensity,
};
pub use ledger::{LedgerUpdate, ThresholdLedger};
pub use model::{LikelihoodOracle, LogDensities, Model};
pub use population::{EvaluationContext, Particle, Population};
pub use posterior::NestedPosterior;
pub use pseudo_likelihood::{
    Distance, PseudoLikelihood, PseudoLikelihoodError, PseudoLikelihoodSettings, SummaryStatistic,
};
pub use sampler::{sample_parallel, sample_sequentially, ChainFailure, NestedSettings, Trace};
pub use storage::{ArrowPosterior, ArrowTrace, PointTrace, TraceExporter, WeightedPoint};
pub use var_info::{Point, VarInfo, VarInfoError, VarSpec};
