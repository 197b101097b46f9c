//! Parameter sets and their schema.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::collections::{BTreeMap, BTreeSet};

use ndarray::ArrayD;
use num::{
    bigint::BigInt,
    rational::Ratio,
    traits::{float::FloatCore, Zero},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named collection of dense parameter tensors, ordered by name.
pub type ParameterSet = BTreeMap<String, ArrayD<f32>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to a mismatch between a set of tensors and a [`ParameterSchema`].
pub enum SchemaError {
    #[error("tensor `{0}` is missing")]
    MissingTensor(String),

    #[error("tensor `{0}` is not part of the schema")]
    UnexpectedTensor(String),

    #[error("tensor `{name}` has shape {actual:?} instead of {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
/// The fixed names and shapes of the tensors of a model.
pub struct ParameterSchema(BTreeMap<String, Vec<usize>>);

impl ParameterSchema {
    /// Creates a schema from tensor names and shapes.
    pub fn new<I, S>(shapes: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<usize>)>,
        S: Into<String>,
    {
        Self(
            shapes
                .into_iter()
                .map(|(name, shape)| (name.into(), shape))
                .collect(),
        )
    }

    /// Derives the schema of the given parameters.
    pub fn of(params: &ParameterSet) -> Self {
        Self::new(
            params
                .iter()
                .map(|(name, tensor)| (name.as_str(), tensor.shape().to_vec())),
        )
    }

    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the schema has no tensors.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the total number of scalar parameters over all tensors.
    pub fn nb_elements(&self) -> usize {
        self.0.values().map(|shape| shape.iter().product::<usize>()).sum()
    }

    /// Iterates over the tensor names and shapes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<usize>)> {
        self.0.iter()
    }

    /// Gets the shape of the named tensor.
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Checks that the given parameters have exactly the names and shapes of this schema.
    pub fn validate(&self, params: &ParameterSet) -> Result<(), SchemaError> {
        self.validate_shapes(
            params
                .iter()
                .map(|(name, tensor)| (name.as_str(), tensor.shape())),
        )
    }

    /// Checks that the given names and shapes are exactly those of this schema.
    pub fn validate_shapes<'a, I>(&self, shapes: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a [usize])>,
    {
        let mut seen = BTreeSet::new();
        for (name, actual) in shapes {
            let expected = self
                .0
                .get(name)
                .ok_or_else(|| SchemaError::UnexpectedTensor(name.to_string()))?;
            if expected.as_slice() != actual {
                return Err(SchemaError::ShapeMismatch {
                    name: name.to_string(),
                    expected: expected.clone(),
                    actual: actual.to_vec(),
                });
            }
            seen.insert(name);
        }
        if let Some(name) = self.0.keys().find(|name| !seen.contains(name.as_str())) {
            return Err(SchemaError::MissingTensor(name.clone()));
        }
        Ok(())
    }
}

/// Converts a numerical value into a primitive floating point value.
///
/// # Errors
/// Fails if the numerical value is not representable in the primitive data type.
pub(crate) fn ratio_to_float<F: FloatCore>(ratio: &Ratio<BigInt>) -> Option<F> {
    let min_value = Ratio::from_float(F::min_value())?;
    let max_value = Ratio::from_float(F::max_value())?;
    if ratio < &min_value || ratio > &max_value {
        return None;
    }

    let mut numer = ratio.numer().clone();
    let mut denom = ratio.denom().clone();
    // safe loop: terminates after at most bit-length of ratio iterations
    loop {
        if let (Some(n), Some(d)) = (F::from(numer.clone()), F::from(denom.clone())) {
            if n == F::zero() || d == F::zero() {
                break Some(F::zero());
            } else {
                let float = n / d;
                if float.is_finite() {
                    break Some(float);
                }
            }
        }
        if numer.is_zero() || denom.is_zero() {
            break Some(F::zero());
        }
        numer >>= 1_usize;
        denom >>= 1_usize;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert("fc.weight".into(), ArrayD::zeros(IxDyn(&[2, 3])));
        params.insert("fc.bias".into(), ArrayD::zeros(IxDyn(&[3])));
        params
    }

    #[test]
    fn test_schema_of() {
        let schema = ParameterSchema::of(&params());
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.nb_elements(), 9);
        assert_eq!(schema.shape("fc.weight"), Some(&[2, 3][..]));
        assert_eq!(
            schema.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            vec!["fc.bias", "fc.weight"],
        );
        assert!(schema.validate(&params()).is_ok());
    }

    #[test]
    fn test_schema_missing_tensor() {
        let schema = ParameterSchema::of(&params());
        let mut params = params();
        params.remove("fc.bias");
        assert_eq!(
            schema.validate(&params).unwrap_err(),
            SchemaError::MissingTensor("fc.bias".into()),
        );
    }

    #[test]
    fn test_schema_unexpected_tensor() {
        let schema = ParameterSchema::of(&params());
        let mut params = params();
        params.insert("conv.weight".into(), ArrayD::zeros(IxDyn(&[1])));
        assert_eq!(
            schema.validate(&params).unwrap_err(),
            SchemaError::UnexpectedTensor("conv.weight".into()),
        );
    }

    #[test]
    fn test_schema_shape_mismatch() {
        let schema = ParameterSchema::of(&params());
        let mut params = params();
        params.insert("fc.weight".into(), ArrayD::zeros(IxDyn(&[3, 2])));
        assert_eq!(
            schema.validate(&params).unwrap_err(),
            SchemaError::ShapeMismatch {
                name: "fc.weight".into(),
                expected: vec![2, 3],
                actual: vec![3, 2],
            },
        );
    }

    #[test]
    fn test_ratio_to_float() {
        let ratio = Ratio::new(BigInt::from(17), BigInt::from(10));
        assert_eq!(ratio_to_float::<f32>(&ratio), Some(1.7_f32));
        assert_eq!(ratio_to_float::<f64>(&ratio), Some(1.7_f64));
        let huge = Ratio::from_integer(BigInt::from(10).pow(40_u32));
        assert_eq!(ratio_to_float::<f32>(&huge), None);
    }
}
