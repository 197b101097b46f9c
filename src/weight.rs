//! Aggregation weights and the rescaling of parameter sets.
//!
//! A participant multiplies its trained parameters by its weight before masking them, the
//! coordinator sums the masked contributions together with their weights and every participant
//! turns the decrypted aggregate back into the weighted mean. The two stages are checked
//! separately, since applying either one twice or not at all silently corrupts the global model.

use std::convert::TryFrom;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mask::ParameterSet;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// A stage of the rescaling of parameter sets.
pub enum ScalingStage {
    #[display(fmt = "global model")]
    GlobalModel,
    #[display(fmt = "weight application")]
    ApplyWeight,
}

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to aggregation weights and rescaling.
pub enum ScalingError {
    #[error("invalid weight {0}: expected a positive finite number")]
    InvalidWeight(f64),

    #[error("invalid {stage} factor {factor}: expected a positive finite number")]
    InvalidFactor { stage: ScalingStage, factor: f64 },

    #[error("{stage} produced {value} in tensor `{name}`, outside of the bound {bound}")]
    OutOfBounds {
        stage: ScalingStage,
        name: String,
        value: f32,
        bound: f64,
    },
}

#[derive(Debug, Display, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
/// A positive finite aggregation weight.
pub struct Weight(f64);

impl TryFrom<f64> for Weight {
    type Error = ScalingError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Weight> for f64 {
    fn from(weight: Weight) -> Self {
        weight.0
    }
}

impl Weight {
    /// Creates a weight.
    ///
    /// # Errors
    /// Fails if the value is not a positive finite number.
    pub fn new(value: f64) -> Result<Self, ScalingError> {
        if is_positive_finite(value) {
            Ok(Self(value))
        } else {
            Err(ScalingError::InvalidWeight(value))
        }
    }

    /// Gets the weight as a float.
    pub fn get(self) -> f64 {
        self.0
    }
}

fn is_positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Multiplies every tensor of the parameter set by `factor`.
pub fn rescale(mut params: ParameterSet, factor: f64) -> ParameterSet {
    for tensor in params.values_mut() {
        tensor.mapv_inplace(|value| (value as f64 * factor) as f32);
    }
    params
}

/// Rescales with pre-condition and post-condition checks.
fn checked_rescale(
    stage: ScalingStage,
    params: ParameterSet,
    factor: f64,
    bound: f64,
) -> Result<ParameterSet, ScalingError> {
    if !is_positive_finite(factor) {
        return Err(ScalingError::InvalidFactor { stage, factor });
    }
    let params = rescale(params, factor);
    for (name, tensor) in params.iter() {
        if let Some(value) = tensor
            .iter()
            .find(|value| !value.is_finite() || value.abs() as f64 > bound)
        {
            return Err(ScalingError::OutOfBounds {
                stage,
                name: name.clone(),
                value: *value,
                bound,
            });
        }
    }
    Ok(params)
}

/// Turns the decrypted aggregate into the weighted mean of the contributions.
///
/// The aggregate is expected to be decrypted with `client_num` as divisor, i.e. it is the plain
/// mean of the weighted contributions. Multiplying by `client_num / weight_sum` yields the weighted
/// mean, which must stay within the masking `bound`.
///
/// # Errors
/// Fails if `client_num` is zero, `weight_sum` is not a positive finite number or a value leaves
/// the bound.
pub fn global_model(
    decrypted: ParameterSet,
    client_num: u32,
    weight_sum: f64,
    bound: f64,
) -> Result<ParameterSet, ScalingError> {
    let stage = ScalingStage::GlobalModel;
    if client_num == 0 {
        return Err(ScalingError::InvalidFactor { stage, factor: 0.0 });
    }
    if !is_positive_finite(weight_sum) {
        return Err(ScalingError::InvalidFactor {
            stage,
            factor: weight_sum,
        });
    }
    checked_rescale(stage, decrypted, client_num as f64 / weight_sum, bound)
}

/// Injects the weight of this participant into its trained parameters before masking.
///
/// # Errors
/// Fails if a weighted value leaves the masking `bound`.
pub fn apply_weight(
    trained: ParameterSet,
    weight: Weight,
    bound: f64,
) -> Result<ParameterSet, ScalingError> {
    checked_rescale(ScalingStage::ApplyWeight, trained, weight.get(), bound)
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn params(value: f32) -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert("w".into(), ArrayD::from_elem(IxDyn(&[2, 2]), value));
        params.insert("b".into(), ArrayD::from_elem(IxDyn(&[2]), -value));
        params
    }

    #[test]
    fn test_weight() {
        assert_eq!(Weight::new(0.3).unwrap().get(), 0.3);
        for invalid in [0.0, -0.3, f64::NAN, f64::INFINITY].iter() {
            assert!(matches!(
                Weight::new(*invalid),
                Err(ScalingError::InvalidWeight(_))
            ));
        }
        assert!(Weight::try_from(-1.0).is_err());
    }

    #[test]
    fn test_rescale_by_one_is_noop() {
        let params = params(0.123_456_79);
        assert_eq!(rescale(params.clone(), 1.0), params);
    }

    #[test]
    fn test_rescale() {
        let rescaled = rescale(params(2.0), 0.5);
        assert_eq!(rescaled, params(1.0));
    }

    #[test]
    fn test_apply_weight() {
        let weighted = apply_weight(params(2.0), Weight::new(0.7).unwrap(), 100.0).unwrap();
        assert!(weighted["w"].iter().all(|value| (value - 1.4).abs() < 1e-6));
        assert!(weighted["b"].iter().all(|value| (value + 1.4).abs() < 1e-6));
    }

    #[test]
    fn test_apply_weight_out_of_bounds() {
        assert_eq!(
            apply_weight(params(2.0), Weight::new(0.7).unwrap(), 1.0).unwrap_err(),
            ScalingError::OutOfBounds {
                stage: ScalingStage::ApplyWeight,
                name: "b".into(),
                value: -1.4,
                bound: 1.0,
            },
        );
    }

    #[test]
    fn test_global_model() {
        // two participants with weights 0.3 and 0.7 sent 0.3 * 1.0 and 0.7 * 2.0, which decrypt
        // with the number of participants as divisor to (0.3 + 1.4) / 2
        let decrypted = params(0.85);
        let global = global_model(decrypted, 2, 1.0, 100.0).unwrap();
        assert!(global["w"].iter().all(|value| (value - 1.7).abs() < 1e-6));

        // weights need not sum up to one
        let global = global_model(params(0.85), 2, 2.0, 100.0).unwrap();
        assert!(global["w"].iter().all(|value| (value - 0.85).abs() < 1e-6));
    }

    #[test]
    fn test_global_model_checks() {
        assert!(matches!(
            global_model(params(1.0), 0, 1.0, 100.0),
            Err(ScalingError::InvalidFactor {
                stage: ScalingStage::GlobalModel,
                ..
            }),
        ));
        assert!(matches!(
            global_model(params(1.0), 2, -1.0, 100.0),
            Err(ScalingError::InvalidFactor { .. }),
        ));
        assert!(matches!(
            global_model(params(1.0), 1_000, 1.0, 100.0),
            Err(ScalingError::OutOfBounds {
                stage: ScalingStage::GlobalModel,
                ..
            }),
        ));
    }
}
