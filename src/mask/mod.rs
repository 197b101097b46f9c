//! Masking, aggregation and unmasking of parameter sets.
//!
//! # Parameter sets
//! A [`ParameterSet`] maps the names of the tensors of a model to their values. The names and
//! shapes never change during the lifetime of a federation and are captured by a
//! [`ParameterSchema`], against which every masked or unmasked set is checked.
//!
//! # Masking configurations
//! The masking, aggregation and unmasking of parameter sets requires certain information to
//! guarantee that no information is lost during the process, which is configured via the
//! [`MaskConfig`]. Each masking configuration consists of the group type, bound type and model
//! type. All values are embedded with 10 decimal places.
//!
//! ## Group type
//! The [`GroupType`] describes the order of the finite group in which the masked values are
//! embedded:
//! - Integer: the smallest order holding the maximum sum.
//! - Power2: the next power of two.
//!
//! ## Bound type
//! The [`BoundType`] describes the absolute bounds on all values. Values beyond the bound are
//! rejected instead of being clamped:
//! - B0: all values are absolutely bounded by 1.
//! - B2: all values are absolutely bounded by 100.
//! - B4: all values are absolutely bounded by 10,000.
//! - B6: all values are absolutely bounded by 1,000,000.
//!
//! ## Model type
//! The [`ModelType`] describes the maximum number of contributions that can be aggregated without
//! information loss:
//! - M3: at most 1,000 contributions may be aggregated.
//! - M6: at most 1,000,000 contributions may be aggregated.
//! - M9: at most 1,000,000,000 contributions may be aggregated.
//! - M12: at most 1,000,000,000,000 contributions may be aggregated.
//!
//! # Masking, aggregation and unmasking
//! A participant masks its parameters with a [`Masker`] before they leave the silo. It adds one
//! mask per peer, derived from the secret it shares with that peer and the round. The participant
//! with the smaller name of a pair adds the mask and the other one subtracts it. The coordinator
//! sums the masked states via an [`Aggregation`], in which the masks cancel out once every member
//! of the federation has contributed, and decodes the sum via an [`Unmasker`] without any key. A
//! single masked state can only be unmasked by its owner.
//!
//! ```
//! # use ndarray::{ArrayD, IxDyn};
//! # use silo_client::{crypto::{EncryptKeyPair, KeyService, PairwiseSecrets, Roster}, mask::{Aggregation, MaskConfig, Masker, ParameterSchema, ParameterSet, Unmasker}, ClientId};
//! let mut params_1 = ParameterSet::new();
//! params_1.insert("w".to_string(), ArrayD::from_elem(IxDyn(&[2, 2]), 1.0));
//! let mut params_2 = ParameterSet::new();
//! params_2.insert("w".to_string(), ArrayD::from_elem(IxDyn(&[2, 2]), 2.0));
//! let schema = ParameterSchema::of(&params_1);
//! let config = MaskConfig::default();
//!
//! // agree on the pairwise secrets via the relayed public keys
//! let (alice, keys_1) = (ClientId::from("alice"), EncryptKeyPair::generate());
//! let (bob, keys_2) = (ClientId::from("bob"), EncryptKeyPair::generate());
//! let roster: Roster = vec![(alice.clone(), keys_1.public), (bob.clone(), keys_2.public)]
//!     .into_iter()
//!     .collect();
//! let key_1 = PairwiseSecrets::agree(&alice, &keys_1, &roster).unwrap().derive_round_key(1).unwrap();
//! let key_2 = PairwiseSecrets::agree(&bob, &keys_2, &roster).unwrap().derive_round_key(1).unwrap();
//!
//! // mask the local parameters
//! let masked_1 = Masker::new(config, &key_1).mask(&schema, &params_1).unwrap();
//! let masked_2 = Masker::new(config, &key_2).mask(&schema, &params_2).unwrap();
//!
//! // aggregate the masked parameters
//! let mut aggregation = Aggregation::new(config, 1);
//! aggregation.aggregate(masked_1).unwrap();
//! aggregation.aggregate(masked_2).unwrap();
//! let aggregate = aggregation.into_state().unwrap();
//!
//! // decode the aggregate into the mean
//! let mean = Unmasker::without_key(config).unmask(&schema, aggregate, 2.0).unwrap();
//! assert!(mean["w"].iter().all(|value| (value - 1.5).abs() < 1e-6));
//! ```

pub(crate) mod config;
pub(crate) mod masking;
pub(crate) mod model;
pub(crate) mod object;
pub(crate) mod seed;

pub use self::{
    config::{BoundType, GroupType, MaskConfig, ModelType, DECIMAL_PLACES},
    masking::{
        Aggregation,
        AggregationError,
        DecryptionError,
        EncryptionError,
        Masker,
        Unmasker,
    },
    model::{ParameterSchema, ParameterSet, SchemaError},
    object::{EncryptedModelState, InvalidMaskObjectError, MaskedTensor},
    seed::{Mask, MaskSeed},
};
