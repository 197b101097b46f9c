//! Masked objects.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::collections::{BTreeMap, BTreeSet};

use num::bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    identity::ClientId,
    mask::{
        config::MaskConfig,
        model::{ParameterSchema, SchemaError},
    },
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to invalid masked objects.
pub enum InvalidMaskObjectError {
    #[error("the masked state holds no contribution")]
    NoContribution,

    #[error("the masked state holds {contributions} contributions but at most {max} are allowed")]
    TooManyContributions { contributions: u64, max: u64 },

    #[error("the masked state holds more masks than contributions")]
    TooManyMaskers,

    #[error("`{0}` masked the state but is not part of its federation")]
    UnknownMasker(ClientId),

    #[error("tensor `{0}` holds elements outside of the finite group")]
    OutOfGroup(String),

    #[error("tensor `{0}` holds a number of elements which does not fit its shape")]
    ShapeMismatch(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A tensor of masked group elements, in logical order.
pub struct MaskedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<BigUint>,
}

impl MaskedTensor {
    /// Creates a masked tensor from its shape and elements.
    pub fn new(shape: Vec<usize>, data: Vec<BigUint>) -> Self {
        Self { shape, data }
    }

    /// Gets the number of elements the shape calls for.
    pub fn nb_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// An encrypted set of parameter tensors.
///
/// Besides the masked tensors it records the round whose key was used, the number of encodings
/// summed into it, the federation whose pairwise masks are in play and the participants whose
/// masks are embedded. The pairwise masks cancel out once every member of the federation has
/// contributed. The plain encoding of a coordinator has neither a federation nor masks.
pub struct EncryptedModelState {
    config: MaskConfig,
    round: u32,
    contributions: u64,
    roster: BTreeSet<ClientId>,
    maskers: BTreeSet<ClientId>,
    tensors: BTreeMap<String, MaskedTensor>,
}

impl EncryptedModelState {
    /// Creates an encrypted state without checking it.
    pub(crate) fn new_unchecked(
        config: MaskConfig,
        round: u32,
        contributions: u64,
        roster: BTreeSet<ClientId>,
        maskers: BTreeSet<ClientId>,
        tensors: BTreeMap<String, MaskedTensor>,
    ) -> Self {
        Self {
            config,
            round,
            contributions,
            roster,
            maskers,
            tensors,
        }
    }

    /// Gets the masking configuration.
    pub fn config(&self) -> &MaskConfig {
        &self.config
    }

    /// Gets the round whose key masks this state.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Gets the number of encodings summed into this state.
    pub fn contributions(&self) -> u64 {
        self.contributions
    }

    /// Gets the federation whose pairwise masks are in play.
    pub fn roster(&self) -> &BTreeSet<ClientId> {
        &self.roster
    }

    /// Gets the participants whose masks are embedded.
    pub fn maskers(&self) -> &BTreeSet<ClientId> {
        &self.maskers
    }

    /// Gets the masked tensors in name order.
    pub fn tensors(&self) -> &BTreeMap<String, MaskedTensor> {
        &self.tensors
    }

    /// Checks whether the pairwise masks of every member of the federation are embedded, in which
    /// case they cancel out.
    pub fn is_complete(&self) -> bool {
        self.maskers == self.roster
    }

    pub(crate) fn into_parts(self) -> (u64, BTreeSet<ClientId>, BTreeMap<String, MaskedTensor>) {
        (self.contributions, self.maskers, self.tensors)
    }

    /// Checks the tensors against the given schema.
    pub fn validate_schema(&self, schema: &ParameterSchema) -> Result<(), SchemaError> {
        schema.validate_shapes(
            self.tensors
                .iter()
                .map(|(name, tensor)| (name.as_str(), tensor.shape.as_slice())),
        )
    }

    /// Checks the integrity of this state wrt its own masking configuration.
    pub fn validate(&self) -> Result<(), InvalidMaskObjectError> {
        if self.contributions == 0 {
            return Err(InvalidMaskObjectError::NoContribution);
        }
        let max = self.config.max_nb_contributions();
        if self.contributions > max {
            return Err(InvalidMaskObjectError::TooManyContributions {
                contributions: self.contributions,
                max,
            });
        }
        if self.maskers.len() as u64 > self.contributions {
            return Err(InvalidMaskObjectError::TooManyMaskers);
        }
        if let Some(masker) = self.maskers.difference(&self.roster).next() {
            return Err(InvalidMaskObjectError::UnknownMasker(masker.clone()));
        }

        let order = self.config.order();
        for (name, tensor) in self.tensors.iter() {
            if tensor.data.len() != tensor.nb_elements() {
                return Err(InvalidMaskObjectError::ShapeMismatch(name.clone()));
            }
            if tensor.data.iter().any(|element| element >= &order) {
                return Err(InvalidMaskObjectError::OutOfGroup(name.clone()));
            }
        }
        Ok(())
    }

    /// Checks whether this state is valid wrt its own masking configuration.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> BTreeSet<ClientId> {
        names.iter().map(|name| ClientId::from(*name)).collect()
    }

    fn state(contributions: u64, maskers: &[&str], data: Vec<BigUint>) -> EncryptedModelState {
        let mut tensors = BTreeMap::new();
        tensors.insert("w".to_string(), MaskedTensor::new(vec![2], data));
        EncryptedModelState::new_unchecked(
            MaskConfig::default(),
            1,
            contributions,
            names(&["alice", "bob"]),
            names(maskers),
            tensors,
        )
    }

    #[test]
    fn test_validate() {
        let ok = state(2, &["alice", "bob"], vec![BigUint::from(1_u8); 2]);
        assert!(ok.is_valid());
        assert!(ok.is_complete());
        assert!(!state(1, &["bob"], vec![BigUint::from(1_u8); 2]).is_complete());
        assert!(ok
            .validate_schema(&ParameterSchema::new(vec![("w", vec![2])]))
            .is_ok());
        assert!(ok
            .validate_schema(&ParameterSchema::new(vec![("w", vec![3])]))
            .is_err());
    }

    #[test]
    fn test_invalid_states() {
        assert_eq!(
            state(0, &[], vec![BigUint::from(1_u8); 2]).validate(),
            Err(InvalidMaskObjectError::NoContribution),
        );
        assert_eq!(
            state(1, &["alice", "bob"], vec![BigUint::from(1_u8); 2]).validate(),
            Err(InvalidMaskObjectError::TooManyMaskers),
        );
        assert_eq!(
            state(2, &["alice", "mallory"], vec![BigUint::from(1_u8); 2]).validate(),
            Err(InvalidMaskObjectError::UnknownMasker(ClientId::from("mallory"))),
        );
        assert_eq!(
            state(1, &[], vec![BigUint::from(1_u8); 3]).validate(),
            Err(InvalidMaskObjectError::ShapeMismatch("w".into())),
        );
        let order = MaskConfig::default().order();
        assert_eq!(
            state(1, &[], vec![BigUint::from(1_u8), order]).validate(),
            Err(InvalidMaskObjectError::OutOfGroup("w".into())),
        );
        assert!(matches!(
            state(1_001, &[], vec![BigUint::from(1_u8); 2]).validate(),
            Err(InvalidMaskObjectError::TooManyContributions { max: 1_000, .. }),
        ));
    }
}
