#![cfg_attr(docsrs, feature(doc_cfg))]
//! A participant of a cross-silo federated learning system.
//!
//! A participant repeatedly fetches the aggregated global model of a round from a coordinator,
//! decrypts and reweights it, trains it on private data and sends the weighted, encrypted update
//! for the next round back. The coordinator only ever sees masked contributions and their sum.
//!
//! # Secure weighted aggregation
//!
//! Every participant `i` with weight `w_i` sends `w_i * x_i` masked with one pseudo-random mask
//! per peer. The mask of a pair is derived from the Diffie-Hellman secret of the two
//! participants and the round. The smaller name of the pair adds it and the larger one subtracts
//! it, so the masks cancel out once every participant has contributed. The coordinator only relays
//! public keys, adds the masked contributions in the finite group of the [`MaskConfig`] and
//! forwards the sum together with the sum of the weights `W` and the number of contributions `n`.
//! Dividing the unmasked sum by `n` yields the mean of the weighted contributions, which
//! [`weight::global_model()`] turns into the weighted mean `sum(w_i * x_i) / W`.
//!
//! # Modules
//!
//! - [`crypto`]: key pairs, the pairwise key agreement and the pseudo-random generation of masks.
//! - [`mask`]: the fixed-point encoding, masking, aggregation and unmasking of parameter sets.
//! - [`codec`]: the codec binding a masking configuration to a model schema.
//! - [`payload`]: the payload files exchanged with the coordinator.
//! - [`weight`]: the two scaling stages around the codec.
//! - [`session`]: the state machine of a participant's session.
//! - [`participant`]: the round loop driving a session and a training step.
//!
//! The transport to the coordinator and the local training are provided by the user through the
//! [`Transport`] and [`TrainingStep`] traits.
//!
//! [`MaskConfig`]: mask::MaskConfig

pub mod codec;
pub mod crypto;
pub mod identity;
pub mod logging;
pub mod mask;
pub mod participant;
pub mod payload;
pub mod session;
pub mod settings;
pub mod training;
pub mod transport;
pub mod weight;

#[cfg(test)]
pub(crate) mod testutils;

pub use self::{
    codec::Codec,
    identity::{ClientId, ClientIdentity},
    participant::{Participant, ParticipantError, ParticipantSettings, RoundError, RoundPhase},
    session::{ClientError, ClientSession, SessionState},
    training::{RoundConfig, TrainingStep},
    transport::{RegistrationResponse, RejectReason, Transport},
    weight::Weight,
};
