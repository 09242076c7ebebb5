//! Mapping between named, shaped model variables and flat parameter vectors.

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VarInfoError {
    #[error("Variable {0} is missing from the point")]
    MissingVariable(String),
    #[error("Variable {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Flat vector has length {found}, expected {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Variable {0} appears more than once")]
    DuplicateVariable(String),
}

/// A structured parameter value: variable names with their array values.
///
/// The order of the entries is the insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    values: Vec<(String, ArrayD<f64>)>,
}

impl Point {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of a variable, replacing an earlier value with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f64>) {
        let name = name.into();
        match self.values.iter_mut().find(|(key, _)| *key == name) {
            Some((_, old)) => *old = value,
            None => self.values.push((name, value)),
        }
    }

    /// Builder style variant of [`Point::insert`].
    pub fn with(mut self, name: impl Into<String>, value: ArrayD<f64>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, val)| val)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &ArrayD<f64>)> {
        self.values.iter().map(|(name, val)| (name.as_str(), val))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, ArrayD<f64>)> for Point {
    fn from_iter<T: IntoIterator<Item = (String, ArrayD<f64>)>>(iter: T) -> Self {
        let mut point = Point::new();
        for (name, value) in iter {
            point.insert(name, value);
        }
        point
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub size: usize,
}

/// Shapes and flat sizes of the model variables, in flattening order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    vars: Vec<VarSpec>,
    dim: usize,
}

impl VarInfo {
    /// Record the shape of every variable of an initial point.
    pub fn from_point(point: &Point) -> Result<Self, VarInfoError> {
        let mut vars: Vec<VarSpec> = Vec::with_capacity(point.len());
        for (name, value) in point.iter() {
            if vars.iter().any(|var| var.name == name) {
                return Err(VarInfoError::DuplicateVariable(name.to_string()));
            }
            vars.push(VarSpec {
                name: name.to_string(),
                shape: value.shape().to_vec(),
                size: value.len(),
            });
        }
        let dim = vars.iter().map(|var| var.size).sum();
        Ok(Self { vars, dim })
    }

    /// Total length of the flat parameter vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vars(&self) -> &[VarSpec] {
        &self.vars
    }

    pub fn names(&self) -> impl ExactSizeIterator<Item = &str> {
        self.vars.iter().map(|var| var.name.as_str())
    }

    /// Concatenate the variables of `point` in row-major order.
    ///
    /// Variables in `point` that are not part of the model are ignored.
    pub fn flatten(&self, point: &Point) -> Result<Box<[f64]>, VarInfoError> {
        let mut out = Vec::with_capacity(self.dim);
        for var in self.vars.iter() {
            let value = point
                .get(&var.name)
                .ok_or_else(|| VarInfoError::MissingVariable(var.name.clone()))?;
            if value.shape() != var.shape.as_slice() {
                return Err(VarInfoError::ShapeMismatch {
                    name: var.name.clone(),
                    expected: var.shape.clone(),
                    found: value.shape().to_vec(),
                });
            }
            out.extend(value.iter().copied());
        }
        Ok(out.into())
    }

    /// Split a flat vector into the named variables.
    pub fn fold(&self, position: &[f64]) -> Result<Point, VarInfoError> {
        if position.len() != self.dim {
            return Err(VarInfoError::LengthMismatch {
                expected: self.dim,
                found: position.len(),
            });
        }
        let mut offset = 0;
        let mut point = Point::new();
        for var in self.vars.iter() {
            let values = position[offset..offset + var.size].to_vec();
            let value = ArrayD::from_shape_vec(IxDyn(&var.shape), values)
                .expect("Size was computed from the shape");
            point.values.push((var.name.clone(), value));
            offset += var.size;
        }
        Ok(point)
    }
}
