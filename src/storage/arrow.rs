use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, LargeListBuilder, RecordBatch, RecordBatchOptions,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use itertools::Itertools;

use super::TraceExporter;
use crate::posterior::NestedPosterior;
use crate::var_info::VarSpec;

const DENSITY_COLUMNS: [&str; 3] = ["prior_logp", "likelihood_logp", "log_weight"];

/// Arrow record batches of one chain.
#[derive(Clone, Debug)]
pub struct ArrowPosterior {
    /// One row per particle: a column per variable and the log densities.
    pub posterior: RecordBatch,
    /// One row per iteration after initialization.
    pub stats: RecordBatch,
}

/// Exports a chain as Arrow record batches.
///
/// Scalar variables become `Float64` columns. Variables with a shape become
/// `LargeList<Float64>` columns of the row-major values, with the shape in
/// the `shape` entry of the field metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrowTrace;

/// Create a field with shape metadata for array valued variables
fn variable_field(var: &VarSpec) -> Field {
    if var.shape.is_empty() {
        return Field::new(&var.name, DataType::Float64, false);
    }
    let metadata = HashMap::from([(
        "shape".to_string(),
        var.shape.iter().map(|size| size.to_string()).join(","),
    )]);
    let inner_field = Field::new("item", DataType::Float64, false);
    Field::new_large_list(&var.name, inner_field, false).with_metadata(metadata)
}

fn variable_column(posterior: &NestedPosterior, offset: usize, var: &VarSpec) -> ArrayRef {
    let values = posterior
        .population()
        .positions()
        .map(|position| &position[offset..offset + var.size]);
    if var.shape.is_empty() {
        return Arc::new(values.map(|value| value[0]).collect::<Float64Array>());
    }
    let num_rows = posterior.particles().len();
    let mut builder = LargeListBuilder::with_capacity(
        Float64Builder::with_capacity(num_rows * var.size),
        num_rows,
    )
    .with_field(Field::new("item", DataType::Float64, false));
    for value in values {
        builder.values().append_slice(value);
        builder.append(true);
    }
    Arc::new(builder.finish())
}

fn posterior_batch(posterior: &NestedPosterior) -> Result<RecordBatch> {
    let vars = posterior.var_info().vars();
    if let Some(var) = vars
        .iter()
        .find(|var| DENSITY_COLUMNS.contains(&var.name.as_str()))
    {
        bail!("Variable name {} is reserved for a density column", var.name);
    }

    let mut fields = Vec::with_capacity(vars.len() + DENSITY_COLUMNS.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(vars.len() + DENSITY_COLUMNS.len());
    let mut offset = 0;
    for var in vars {
        fields.push(variable_field(var));
        columns.push(variable_column(posterior, offset, var));
        offset += var.size;
    }

    let particles = posterior.particles();
    let prior: Float64Array = particles.iter().map(|p| p.prior_logp()).collect();
    let likelihood: Float64Array = particles.iter().map(|p| p.likelihood_logp()).collect();
    let weights = Float64Array::from(posterior.log_weights().to_vec());
    for (name, column) in DENSITY_COLUMNS.iter().zip([prior, likelihood, weights]) {
        fields.push(Field::new(*name, DataType::Float64, false));
        columns.push(Arc::new(column));
    }

    let options = RecordBatchOptions::new().with_row_count(Some(particles.len()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), columns, &options)
        .context("Could not convert posterior to RecordBatch")
}

fn stats_batch(posterior: &NestedPosterior) -> Result<RecordBatch> {
    let history = posterior.history();
    macro_rules! column {
        ($array:ty, $value:expr) => {
            Arc::new(history.iter().map($value).collect::<$array>()) as ArrayRef
        };
    }

    let columns = [
        ("chain", column!(UInt64Array, |s| s.chain)),
        ("iteration", column!(UInt64Array, |s| s.iteration)),
        ("cutoff", column!(Float64Array, |s| s.cutoff)),
        ("log_evidence", column!(Float64Array, |s| s.log_evidence)),
        (
            "log_evidence_increment",
            column!(Float64Array, |s| s.log_evidence_increment),
        ),
        (
            "num_candidates",
            column!(UInt64Array, |s| s.num_candidates as u64),
        ),
        ("num_retained", column!(UInt64Array, |s| s.num_retained as u64)),
        ("acceptance_rate", column!(Float64Array, |s| s.acceptance_rate)),
        ("train_loss", column!(Float64Array, |s| s.train_loss)),
        ("validation_loss", column!(Float64Array, |s| s.validation_loss)),
        ("duration", column!(Float64Array, |s| s.duration.as_secs_f64())),
    ];

    let fields = columns
        .iter()
        .map(|(name, column)| {
            Field::new(*name, column.data_type().clone(), column.null_count() > 0)
        })
        .collect_vec();
    let arrays = columns.into_iter().map(|(_, column)| column).collect_vec();
    let options = RecordBatchOptions::new().with_row_count(Some(history.len()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)
        .context("Could not convert iteration stats to RecordBatch")
}

impl TraceExporter for ArrowTrace {
    type Output = ArrowPosterior;

    fn export(&self, posterior: &NestedPosterior) -> Result<Self::Output> {
        Ok(ArrowPosterior {
            posterior: posterior_batch(posterior)?,
            stats: stats_batch(posterior)?,
        })
    }
}
