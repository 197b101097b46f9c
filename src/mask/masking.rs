//! Masking, aggregation and unmasking of parameter sets.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::{
    collections::{BTreeMap, BTreeSet},
    iter,
};

use ndarray::{ArrayD, IxDyn};
use num::{
    bigint::{BigInt, BigUint, ToBigInt, ToBigUint},
    rational::Ratio,
    traits::{Signed, Zero},
};
use thiserror::Error;

use crate::{
    crypto::RoundKey,
    identity::ClientId,
    mask::{
        config::MaskConfig,
        model::{ratio_to_float, ParameterSchema, ParameterSet, SchemaError},
        object::{EncryptedModelState, InvalidMaskObjectError, MaskedTensor},
        seed::{Mask, MaskSeed},
    },
};

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to the masking of parameter sets.
pub enum EncryptionError {
    #[error("the parameters do not match the schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("tensor `{name}` holds a non-finite value at index {index}")]
    NonFinite { name: String, index: usize },

    #[error("tensor `{name}` holds {value} at index {index}, outside of the bound {bound}")]
    OutOfBounds {
        name: String,
        index: usize,
        value: f32,
        bound: u64,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to the unmasking of encrypted states.
pub enum DecryptionError {
    #[error("invalid divisor {0}: expected a positive finite number")]
    InvalidDivisor(f64),

    #[error("the encrypted state was masked with a different configuration")]
    ConfigMismatch,

    #[error("the encrypted state belongs to round {actual} but the key to round {expected}")]
    RoundMismatch { expected: u32, actual: u32 },

    #[error("the encrypted state belongs to another federation than the key")]
    RosterMismatch,

    #[error("the encrypted state still holds pairwise masks but no key was given")]
    MissingKey,

    #[error("the key lacks the pairwise mask of `{masker}` and `{peer}`")]
    MissingPairKey { masker: ClientId, peer: ClientId },

    #[error("invalid encrypted state: {0}")]
    InvalidObject(#[from] InvalidMaskObjectError),

    #[error("the encrypted state does not match the schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("tensor `{name}` decrypts to an unrepresentable value at index {index}")]
    OutOfRange { name: String, index: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
/// Errors related to the aggregation of encrypted states.
pub enum AggregationError {
    #[error("invalid encrypted state: {0}")]
    InvalidObject(#[from] InvalidMaskObjectError),

    #[error("the encrypted state was masked with a different configuration")]
    ConfigMismatch,

    #[error("the encrypted state belongs to round {actual} instead of {expected}")]
    RoundMismatch { expected: u32, actual: u32 },

    #[error("the encrypted state belongs to another federation than the aggregate")]
    RosterMismatch,

    #[error("the encrypted state does not match the aggregated tensors")]
    ModelMismatch,

    #[error("the mask of `{0}` is already part of the aggregate")]
    DuplicateMasker(ClientId),

    #[error("too many contributions were aggregated for the current masking configuration")]
    TooManyContributions,
}

/// Checks whether the `masker` adds the mask it shares with the `peer`, else it subtracts it.
fn adds_pair_mask(masker: &ClientId, peer: &ClientId) -> bool {
    masker < peer
}

/// Adds or subtracts the `mask` to or from the `sum` modulo the `order`.
fn accumulate(sum: &mut Mask, mask: Mask, add: bool, order: &BigUint) {
    for (name, ints) in mask {
        if let Some(acc) = sum.get_mut(&name) {
            for (i, j) in acc.iter_mut().zip(ints) {
                *i = if add {
                    (&*i + j) % order
                } else {
                    // PANIC_SAFE: both elements are reduced modulo the order
                    (&*i + order - j) % order
                };
            }
        }
    }
}

/// Sums the pairwise masks of the given seeds with their signs.
fn signed_sum<I>(seeds: I, schema: &ParameterSchema, config: &MaskConfig) -> Mask
where
    I: IntoIterator<Item = (bool, MaskSeed)>,
{
    let order = config.order();
    let mut sum: Mask = schema
        .iter()
        .map(|(name, shape)| (name.clone(), vec![BigUint::zero(); shape.iter().product()]))
        .collect();
    for (add, seed) in seeds {
        accumulate(&mut sum, seed.derive_mask(schema, config), add, &order);
    }
    sum
}

/// A masker for parameter sets.
pub struct Masker<'a> {
    config: MaskConfig,
    round: u32,
    key: Option<&'a RoundKey>,
}

impl<'a> Masker<'a> {
    /// Creates a masker which adds the pairwise masks of the owner of the `key` in its round.
    pub fn new(config: MaskConfig, key: &'a RoundKey) -> Self {
        Self {
            config,
            round: key.round(),
            key: Some(key),
        }
    }

    /// Creates a masker which only embeds the values into the finite group.
    ///
    /// The resulting state is readable by anyone with the configuration. It is meant for the
    /// initial model a coordinator publishes.
    pub fn public(config: MaskConfig, round: u32) -> Self {
        Self {
            config,
            round,
            key: None,
        }
    }

    /// Masks the given `params` wrt the masking configuration.
    ///
    /// The masking proceeds in the following steps:
    /// - Check the parameters against the `schema`.
    /// - Reject non-finite values and values beyond the bound of the configuration.
    /// - Shift the values into the non-negative reals.
    /// - Shift the values into the non-negative integers.
    /// - Add the mask shared with every peer if the owner's name is the smaller one of the pair,
    ///   else subtract it.
    ///
    /// # Errors
    /// Fails if the parameters don't match the schema or hold a value which cannot be embedded.
    pub fn mask(
        self,
        schema: &ParameterSchema,
        params: &ParameterSet,
    ) -> Result<EncryptedModelState, EncryptionError> {
        schema.validate(params)?;
        let Self { config, round, key } = self;
        let (roster, maskers, mut mask) = match key {
            Some(key) => {
                let owner = key.owner();
                let seeds = key.peers().filter_map(|peer| {
                    MaskSeed::pairwise(key, peer).map(|seed| (adds_pair_mask(owner, peer), seed))
                });
                let mask = signed_sum(seeds, schema, &config);
                (key.roster(), iter::once(owner.clone()).collect(), Some(mask))
            }
            None => (BTreeSet::new(), BTreeSet::new(), None),
        };

        let order = config.order();
        let tensors = params
            .iter()
            .map(|(name, tensor)| {
                let mut random_ints = mask
                    .as_mut()
                    .and_then(|mask| mask.remove(name))
                    .map(Vec::into_iter);
                let data = tensor
                    .iter()
                    .enumerate()
                    .map(|(index, value)| {
                        let encoded = encode(&config, name, index, *value)?;
                        Ok(match random_ints.as_mut().and_then(Iterator::next) {
                            Some(rand_int) => (encoded + rand_int) % &order,
                            None => encoded,
                        })
                    })
                    .collect::<Result<Vec<_>, EncryptionError>>()?;
                Ok((
                    name.clone(),
                    MaskedTensor::new(tensor.shape().to_vec(), data),
                ))
            })
            .collect::<Result<BTreeMap<_, _>, EncryptionError>>()?;

        Ok(EncryptedModelState::new_unchecked(
            config, round, 1, roster, maskers, tensors,
        ))
    }
}

/// Embeds a single value as a non-negative integer.
fn encode(
    config: &MaskConfig,
    name: &str,
    index: usize,
    value: f32,
) -> Result<BigUint, EncryptionError> {
    let ratio = Ratio::<BigInt>::from_float(value).ok_or_else(|| EncryptionError::NonFinite {
        name: name.to_string(),
        index,
    })?;
    let add_shift = config.add_shift();
    if ratio.abs() > add_shift {
        return Err(EncryptionError::OutOfBounds {
            name: name.to_string(),
            index,
            value,
            bound: config.bound(),
        });
    }
    // PANIC_SAFE: the shifted value is guaranteed to be non-negative
    Ok(((ratio + &add_shift) * config.exp_shift())
        .floor()
        .to_integer()
        .to_biguint()
        .unwrap())
}

/// An unmasker for encrypted states.
///
/// The pairwise masks of a pair of participants cancel out once both contributed. Whatever is
/// left can only be removed by one of the two participants of each remaining pair.
pub struct Unmasker<'a> {
    config: MaskConfig,
    key: Option<&'a RoundKey>,
}

impl<'a> Unmasker<'a> {
    /// Creates an unmasker for states masked in the round of the `key`.
    pub fn new(config: MaskConfig, key: &'a RoundKey) -> Self {
        Self {
            config,
            key: Some(key),
        }
    }

    /// Creates an unmasker without any key material.
    ///
    /// It only decodes states in which no pairwise mask is left, i.e. complete aggregates and
    /// public encodings.
    pub fn without_key(config: MaskConfig) -> Self {
        Self { config, key: None }
    }

    /// Validates if unmasking of the given `state` may be safely performed.
    ///
    /// # Errors
    /// Fails in one of the following cases:
    /// - The `divisor` is not a positive finite number.
    /// - The masking configuration of the unmasker and of the `state` don't coincide.
    /// - The `state` belongs to another round or another federation than the key.
    /// - The `state` itself is invalid or doesn't match the `schema`.
    /// - A pairwise mask left in the `state` is unknown to the key.
    pub fn validate_unmasking(
        &self,
        schema: &ParameterSchema,
        state: &EncryptedModelState,
        divisor: f64,
    ) -> Result<(), DecryptionError> {
        if !divisor.is_finite() || divisor <= 0.0 {
            return Err(DecryptionError::InvalidDivisor(divisor));
        }
        if state.config() != &self.config {
            return Err(DecryptionError::ConfigMismatch);
        }
        if let Some(key) = self.key {
            if state.round() != key.round() {
                return Err(DecryptionError::RoundMismatch {
                    expected: key.round(),
                    actual: state.round(),
                });
            }
            if !state.roster().is_empty() && state.roster() != &key.roster() {
                return Err(DecryptionError::RosterMismatch);
            }
        }
        state.validate()?;
        state.validate_schema(schema)?;
        self.residual_seeds(state)?;
        Ok(())
    }

    /// Unmasks the given `state` and divides the decoded values by the `divisor`.
    ///
    /// The pairwise masks which did not cancel out are derived and removed, then every value is
    /// shifted back by the bound once per summed contribution. A sum outside of the representable
    /// range reveals that the masks did not match, i.e. a wrong key or a corrupted state.
    ///
    /// # Errors
    /// Fails if [`validate_unmasking()`] fails or a value is out of the representable range.
    ///
    /// [`validate_unmasking()`]: Unmasker::validate_unmasking
    pub fn unmask(
        &self,
        schema: &ParameterSchema,
        state: EncryptedModelState,
        divisor: f64,
    ) -> Result<ParameterSet, DecryptionError> {
        self.validate_unmasking(schema, &state, divisor)?;
        let mut mask = signed_sum(self.residual_seeds(&state)?, schema, &self.config);
        let config = self.config;
        let (contributions, _, tensors) = state.into_parts();

        let order = config.order();
        let max_sum = config.max_encoding() * contributions;
        let scaled_add_shift = config.add_shift() * BigInt::from(contributions);
        let exp_shift = config.exp_shift();
        // safe unwrap: the divisor is finite
        let divisor = Ratio::<BigInt>::from_float(divisor).unwrap();

        tensors
            .into_iter()
            .map(|(name, tensor)| {
                let out_of_range = |index| DecryptionError::OutOfRange {
                    name: name.clone(),
                    index,
                };
                let mut mask_ints = mask.remove(&name).map(Vec::into_iter);
                let values = tensor
                    .data
                    .into_iter()
                    .enumerate()
                    .map(|(index, masked)| {
                        let n = match mask_ints.as_mut().and_then(Iterator::next) {
                            // PANIC_SAFE: the state and the mask are reduced modulo the order
                            Some(mask) => (masked + &order - mask) % &order,
                            None => masked,
                        };
                        if n > max_sum {
                            return Err(out_of_range(index));
                        }
                        // UNWRAP_SAFE: to_bigint never fails for BigUint
                        let ratio = Ratio::<BigInt>::from(n.to_bigint().unwrap());
                        let unmasked = (ratio / &exp_shift - &scaled_add_shift) / &divisor;
                        ratio_to_float::<f64>(&unmasked)
                            .map(|value| value as f32)
                            .filter(|value| value.is_finite())
                            .ok_or_else(|| out_of_range(index))
                    })
                    .collect::<Result<Vec<f32>, DecryptionError>>()?;
                let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), values)
                    .map_err(|_| InvalidMaskObjectError::ShapeMismatch(name.clone()))?;
                Ok((name, array))
            })
            .collect()
    }

    /// Gets the seeds of the pairwise masks left in the `state`, with the sign its maskers
    /// applied.
    ///
    /// A mask is left for every pair of a masker and a member of the federation which did not
    /// contribute. Only a participant of the pair knows its seed.
    fn residual_seeds(
        &self,
        state: &EncryptedModelState,
    ) -> Result<Vec<(bool, MaskSeed)>, DecryptionError> {
        let mut seeds = Vec::new();
        for masker in state.maskers() {
            for peer in state.roster().difference(state.maskers()) {
                let key = self.key.ok_or(DecryptionError::MissingKey)?;
                let seed = if masker == key.owner() {
                    MaskSeed::pairwise(key, peer)
                } else if peer == key.owner() {
                    MaskSeed::pairwise(key, masker)
                } else {
                    None
                };
                let seed = seed.ok_or_else(|| DecryptionError::MissingPairKey {
                    masker: masker.clone(),
                    peer: peer.clone(),
                })?;
                seeds.push((adds_pair_mask(masker, peer), seed));
            }
        }
        Ok(seeds)
    }
}

#[derive(Debug, Clone)]
/// An aggregator for encrypted states.
///
/// This is the summation a coordinator performs. It never needs any key material.
pub struct Aggregation {
    config: MaskConfig,
    round: u32,
    state: Option<EncryptedModelState>,
}

impl From<EncryptedModelState> for Aggregation {
    fn from(state: EncryptedModelState) -> Self {
        Self {
            config: *state.config(),
            round: state.round(),
            state: Some(state),
        }
    }
}

impl Aggregation {
    /// Creates a new, empty aggregator for the states of the given round.
    pub fn new(config: MaskConfig, round: u32) -> Self {
        Self {
            config,
            round,
            state: None,
        }
    }

    /// Gets the number of contributions aggregated so far.
    pub fn nb_contributions(&self) -> u64 {
        self.state
            .as_ref()
            .map(EncryptedModelState::contributions)
            .unwrap_or_default()
    }

    /// Validates if aggregation of the given `state` may be safely performed.
    ///
    /// # Errors
    /// Fails in one of the following cases:
    /// - The `state` itself is invalid.
    /// - The masking configuration or the round of the aggregator and of the `state` don't
    ///   coincide.
    /// - The `state` belongs to another federation than the aggregate.
    /// - The tensors of the aggregate and of the `state` don't coincide.
    /// - A mask of the `state` is already part of the aggregate.
    /// - The new number of aggregated contributions would exceed the number that the chosen
    ///   masking configuration allows.
    pub fn validate_aggregation(&self, state: &EncryptedModelState) -> Result<(), AggregationError> {
        state.validate()?;
        if state.config() != &self.config {
            return Err(AggregationError::ConfigMismatch);
        }
        if state.round() != self.round {
            return Err(AggregationError::RoundMismatch {
                expected: self.round,
                actual: state.round(),
            });
        }

        let aggregate = match self.state {
            Some(ref aggregate) => aggregate,
            None => return Ok(()),
        };
        if aggregate.roster() != state.roster() {
            return Err(AggregationError::RosterMismatch);
        }
        let same_tensors = aggregate.tensors().len() == state.tensors().len()
            && aggregate
                .tensors()
                .iter()
                .zip(state.tensors())
                .all(|((name_1, tensor_1), (name_2, tensor_2))| {
                    name_1 == name_2 && tensor_1.shape == tensor_2.shape
                });
        if !same_tensors {
            return Err(AggregationError::ModelMismatch);
        }
        if let Some(masker) = state
            .maskers()
            .intersection(aggregate.maskers())
            .next()
        {
            return Err(AggregationError::DuplicateMasker(masker.clone()));
        }
        if aggregate.contributions() + state.contributions() > self.config.max_nb_contributions()
        {
            return Err(AggregationError::TooManyContributions);
        }
        Ok(())
    }

    /// Aggregates the given `state` into the aggregate.
    ///
    /// # Errors
    /// Fails if [`validate_aggregation()`] fails.
    ///
    /// [`validate_aggregation()`]: Aggregation::validate_aggregation
    pub fn aggregate(&mut self, state: EncryptedModelState) -> Result<(), AggregationError> {
        self.validate_aggregation(&state)?;
        let aggregate = match self.state.take() {
            Some(aggregate) => aggregate,
            None => {
                self.state = Some(state);
                return Ok(());
            }
        };

        let order = self.config.order();
        let roster = aggregate.roster().clone();
        let (contributions_1, mut maskers, mut tensors) = aggregate.into_parts();
        let (contributions_2, maskers_2, tensors_2) = state.into_parts();
        for (name, tensor) in tensors_2 {
            if let Some(sum) = tensors.get_mut(&name) {
                for (i, j) in sum.data.iter_mut().zip(tensor.data) {
                    *i = (&*i + j) % &order;
                }
            }
        }
        maskers.extend(maskers_2);

        self.state = Some(EncryptedModelState::new_unchecked(
            self.config,
            self.round,
            contributions_1 + contributions_2,
            roster,
            maskers,
            tensors,
        ));
        Ok(())
    }

    /// Gets the aggregated state, if any state has been aggregated.
    pub fn into_state(self) -> Option<EncryptedModelState> {
        self.state
    }
}
