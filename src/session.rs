//! The client session state machine.
//!
//! A [`ClientSession`] owns the identity of a participant, the codec and the transport. It only
//! allows the operations which make sense in its current [`SessionState`]:
//!
//! ```text
//! Unregistered -> Registered -> AwaitingRound(r) -> Training(r) -> Sending(r + 1)
//!                                      ^                                |
//!                                      +-------- AwaitingRound(r + 1) <-+
//! ```
//!
//! Every state can go to `Stopped`. The weight of a round can only be set through
//! [`ClientSession::set_weight()`], once per round, and is forgotten as soon as the update of the
//! round has been sent. An update is encrypted at most once per round, since a second encryption
//! under the same masks would reveal the difference of the two plaintexts.

use std::path::Path;

use derive_more::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    codec::Codec,
    crypto::{KeyAgreementError, KeyService, RoundKey},
    identity::{ClientId, ClientIdentity},
    mask::{DecryptionError, EncryptedModelState, EncryptionError, ParameterSet},
    payload::{CorruptPayloadError, InboundPayload, OutboundPayload, PayloadWriteError},
    transport::{RegistrationResponse, RejectReason, Transport},
    weight::{self, ScalingError, Weight},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The state of a [`ClientSession`].
pub enum SessionState {
    /// The participant is not known to the coordinator yet.
    #[display(fmt = "unregistered")]
    Unregistered,
    /// The participant holds its pairwise secrets but has not fetched any round yet.
    #[display(fmt = "registered")]
    Registered,
    /// The participant waits for the aggregate of the round.
    #[display(fmt = "awaiting round {}", round)]
    AwaitingRound { round: u32 },
    /// The participant holds the global model of the round.
    #[display(fmt = "training round {}", round)]
    Training { round: u32 },
    /// The participant holds its sealed contribution to the round.
    #[display(fmt = "sending round {}", round)]
    Sending { round: u32 },
    /// The session is over.
    #[display(fmt = "stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The weight slot of a session.
pub enum RoundWeight {
    /// No weight has been set for the current round.
    Unset,
    /// The weight of the given round.
    Set { round: u32, weight: Weight },
}

#[derive(Debug, Error)]
/// Errors related to the registration with the coordinator.
pub enum RegistrationError {
    #[error("the coordinator rejected the registration: {0}")]
    Rejected(RejectReason),

    #[error("the roster relayed by the coordinator is unusable: {0}")]
    KeyAgreement(#[from] KeyAgreementError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no weight has been set for round {round}")]
/// The update of a round was encrypted before its weight was set.
pub struct WeightNotSetError {
    pub round: u32,
}

#[derive(Debug, Error)]
#[error("the training step failed in round {round}: {source}")]
/// The external training step failed.
pub struct TrainingStepFailure {
    pub round: u32,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
#[error("the transport failed to {operation}: {source}")]
/// The external transport failed.
pub struct TransportError {
    pub operation: &'static str,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
/// Errors of a participant.
pub enum ClientError {
    #[error("the session has already been started")]
    AlreadyStarted,

    #[error("the session has not been started")]
    NotStarted,

    #[error("`{operation}` is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("expected round {expected} but got round {actual}")]
    RoundMismatch { expected: u32, actual: u32 },

    #[error("the weight of round {0} has already been set")]
    WeightAlreadySet(u32),

    #[error("no key material for round {0}, the session is not registered")]
    KeyUnavailable(u32),

    #[error("an update for round {0} has already been encrypted")]
    AlreadySealed(u32),

    #[error("round {0} has no successor")]
    RoundOverflow(u32),

    #[error("the encrypted update differs from the trained parameters in `{name}` at index {index}")]
    UpdateMismatch { name: String, index: usize },

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    CorruptPayload(#[from] CorruptPayloadError),

    #[error(transparent)]
    PayloadWrite(#[from] PayloadWriteError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Scaling(#[from] ScalingError),

    #[error(transparent)]
    WeightNotSet(#[from] WeightNotSetError),

    #[error(transparent)]
    TrainingStep(#[from] TrainingStepFailure),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The session of a participant with the coordinator.
pub struct ClientSession<T> {
    identity: ClientIdentity,
    codec: Codec,
    transport: T,
    connected: bool,
    state: SessionState,
    weight: RoundWeight,
    sealed_round: Option<u32>,
}

impl<T> std::fmt::Debug for ClientSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("identity", &self.identity)
            .field("connected", &self.connected)
            .field("state", &self.state)
            .field("weight", &self.weight)
            .field("sealed_round", &self.sealed_round)
            .finish()
    }
}

impl<T> ClientSession<T>
where
    T: Transport,
{
    /// Creates a session. Nothing is sent before [`start()`] is called.
    ///
    /// [`start()`]: ClientSession::start
    pub fn new(identity: ClientIdentity, codec: Codec, transport: T) -> Self {
        Self {
            identity,
            codec,
            transport,
            connected: false,
            state: SessionState::Unregistered,
            weight: RoundWeight::Unset,
            sealed_round: None,
        }
    }

    /// Gets the name of the participant.
    pub fn id(&self) -> &ClientId {
        self.identity.id()
    }

    /// Gets the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gets the weight slot of the current round.
    pub fn round_weight(&self) -> RoundWeight {
        self.weight
    }

    /// Checks whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Gets the codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Opens the transport.
    ///
    /// # Errors
    /// Fails if the session was already started or stopped, or if the transport fails.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.state == SessionState::Stopped {
            return Err(self.invalid_state("start"));
        }
        if self.connected {
            return Err(ClientError::AlreadyStarted);
        }
        self.transport
            .connect()
            .map_err(|source| TransportError {
                operation: "connect",
                source,
            })?;
        self.connected = true;
        info!(client = %self.id(), "session started");
        Ok(())
    }

    /// Registers with the coordinator and agrees on a secret with every peer of the relayed
    /// roster.
    ///
    /// # Errors
    /// Fails if the session is not started or already registered, if the coordinator rejects the
    /// participant or if the relayed roster is unusable.
    pub fn register(&mut self) -> Result<(), ClientError> {
        self.ensure_connected()?;
        if self.state != SessionState::Unregistered {
            return Err(self.invalid_state("register"));
        }

        debug!(client = %self.id(), "registering");
        let response = self
            .transport
            .register(self.identity.id(), self.identity.public_key())
            .map_err(|source| TransportError {
                operation: "register",
                source,
            })?;
        match response {
            RegistrationResponse::Accepted(roster) => {
                self.identity
                    .accept_roster(&roster)
                    .map_err(RegistrationError::from)?;
                self.state = SessionState::Registered;
                info!(client = %self.id(), members = roster.len(), "registered");
                Ok(())
            }
            RegistrationResponse::Rejected(reason) => {
                warn!(client = %self.id(), "registration rejected: {}", reason);
                Err(RegistrationError::Rejected(reason).into())
            }
        }
    }

    /// Sets the weight of the current round.
    ///
    /// # Errors
    /// Fails if no round is in progress or the weight of the round has already been set.
    pub fn set_weight(&mut self, weight: Weight) -> Result<(), ClientError> {
        let round = match self.state {
            SessionState::AwaitingRound { round } | SessionState::Training { round } => round,
            _ => return Err(self.invalid_state("set_weight")),
        };
        if let RoundWeight::Set { round: set, .. } = self.weight {
            if set == round {
                return Err(ClientError::WeightAlreadySet(round));
            }
        }
        debug!(round, weight = weight.get(), "weight set");
        self.weight = RoundWeight::Set { round, weight };
        Ok(())
    }

    /// Fetches and unpacks the aggregate of the given round.
    ///
    /// The first fetch after the registration may pick any round, every later one must fetch the
    /// round the last update was sent for.
    ///
    /// # Errors
    /// Fails if the round is not the awaited one, the transport fails or the payload is corrupt.
    pub fn fetch(&mut self, round: u32) -> Result<InboundPayload, ClientError> {
        self.ensure_connected()?;
        match self.state {
            SessionState::Registered => {}
            SessionState::AwaitingRound { round: expected } if expected != round => {
                return Err(ClientError::RoundMismatch {
                    expected,
                    actual: round,
                });
            }
            SessionState::AwaitingRound { .. } => {}
            _ => return Err(self.invalid_state("fetch")),
        }

        debug!(round, "fetching global model");
        let path = self
            .transport
            .fetch(round, self.identity.id())
            .map_err(|source| TransportError {
                operation: "fetch",
                source,
            })?;
        let payload = self.codec.unpack(&path)?;
        if payload.model_state.round() != round {
            return Err(ClientError::RoundMismatch {
                expected: round,
                actual: payload.model_state.round(),
            });
        }
        self.state = SessionState::AwaitingRound { round };
        info!(
            round,
            client_num = payload.client_num,
            "fetched global model"
        );
        Ok(payload)
    }

    /// Decrypts a fetched aggregate into the weighted mean of the contributions.
    ///
    /// # Errors
    /// Fails if the payload does not belong to the awaited round, cannot be decrypted or the
    /// weighted mean leaves the masking bound.
    pub fn global_model(&mut self, inbound: InboundPayload) -> Result<ParameterSet, ClientError> {
        let round = match self.state {
            SessionState::AwaitingRound { round } => round,
            _ => return Err(self.invalid_state("global_model")),
        };
        let InboundPayload {
            model_state,
            weight_sum,
            client_num,
        } = inbound;
        if model_state.round() != round {
            return Err(ClientError::RoundMismatch {
                expected: round,
                actual: model_state.round(),
            });
        }

        let decrypted = self.decrypt(model_state, client_num as f64)?;
        let global = weight::global_model(decrypted, client_num, weight_sum, self.codec.bound())?;
        self.state = SessionState::Training { round };
        debug!(round, "decrypted global model");
        Ok(global)
    }

    /// Decrypts an encrypted state under the key of its round and divides it by `divisor`.
    ///
    /// # Errors
    /// Fails if the session is not registered or the state cannot be decrypted.
    pub fn decrypt(
        &self,
        state: EncryptedModelState,
        divisor: f64,
    ) -> Result<ParameterSet, ClientError> {
        let key = self.round_key(state.round())?;
        Ok(self.codec.decrypt(&key, state, divisor)?)
    }

    /// Weights and encrypts the trained parameters of the current round for the next round.
    ///
    /// # Errors
    /// Fails if no round is being trained, the weight of the round is not set, the weighted
    /// parameters leave the masking bound or cannot be encrypted. Fails as well if an update for
    /// the next round has already been encrypted or if the current round is the last one.
    pub fn encrypt(&mut self, params: &ParameterSet) -> Result<EncryptedModelState, ClientError> {
        let round = match self.state {
            SessionState::Training { round } => round,
            _ => return Err(self.invalid_state("encrypt")),
        };
        let next_round = round
            .checked_add(1)
            .ok_or(ClientError::RoundOverflow(round))?;
        if self
            .sealed_round
            .map_or(false, |sealed| sealed >= next_round)
        {
            return Err(ClientError::AlreadySealed(next_round));
        }
        let weight = self.weight_of(round)?;
        let weighted = weight::apply_weight(params.clone(), weight, self.codec.bound())?;
        let key = self.round_key(next_round)?;
        let model_state = self.codec.encrypt(&key, &weighted)?;
        self.sealed_round = Some(next_round);
        Ok(model_state)
    }

    /// Seals the trained parameters of the current round as the outbound payload.
    ///
    /// # Errors
    /// Fails for the same reasons as [`encrypt()`].
    ///
    /// [`encrypt()`]: ClientSession::encrypt
    pub fn seal_update(&mut self, params: &ParameterSet) -> Result<OutboundPayload, ClientError> {
        let trained = match self.state {
            SessionState::Training { round } => round,
            _ => return Err(self.invalid_state("seal_update")),
        };
        let model_state = self.encrypt(params)?;
        let weight = self.weight_of(trained)?;
        let round = model_state.round();
        self.state = SessionState::Sending { round };
        debug!(round, "sealed update");
        Ok(OutboundPayload {
            model_state,
            client_weight: weight.get(),
        })
    }

    /// Checks that a sealed `outbound` payload decrypts to the trained `params` it was sealed
    /// from, scaled by its weight.
    ///
    /// # Errors
    /// Fails with [`ClientError::UpdateMismatch`] at the first value which differs, or if the
    /// payload cannot be decrypted.
    pub fn verify_update(
        &self,
        outbound: &OutboundPayload,
        params: &ParameterSet,
    ) -> Result<(), ClientError> {
        let weight = Weight::new(outbound.client_weight)?;
        let expected = weight::apply_weight(params.clone(), weight, self.codec.bound())?;
        let decrypted = self.decrypt(outbound.model_state.clone(), 1.0)?;
        for (name, tensor) in expected.iter() {
            let mismatch = |index| ClientError::UpdateMismatch {
                name: name.clone(),
                index,
            };
            let actual = decrypted.get(name).ok_or_else(|| mismatch(0))?;
            if let Some((index, _)) = tensor
                .iter()
                .zip(actual.iter())
                .enumerate()
                .find(|(_, (x, y))| (*x - *y).abs() > 1e-5 * x.abs().max(1.0))
            {
                return Err(mismatch(index));
            }
        }
        debug!(round = outbound.model_state.round(), "verified update");
        Ok(())
    }

    /// Hands the sealed payload at `path` to the transport as the contribution to `round`.
    ///
    /// # Errors
    /// Fails if no update is sealed, the update was sealed for another round or the transport
    /// fails.
    pub fn send_model(&mut self, path: &Path, round: u32) -> Result<(), ClientError> {
        self.ensure_connected()?;
        match self.state {
            SessionState::Sending { round: sealed } if sealed != round => {
                return Err(ClientError::RoundMismatch {
                    expected: sealed,
                    actual: round,
                });
            }
            SessionState::Sending { .. } => {}
            _ => return Err(self.invalid_state("send_model")),
        }

        self.transport
            .deliver(path, round, self.identity.id())
            .map_err(|source| TransportError {
                operation: "deliver",
                source,
            })?;
        self.state = SessionState::AwaitingRound { round };
        self.weight = RoundWeight::Unset;
        info!(round, "sent update");
        Ok(())
    }

    /// Closes the transport. Stopping a stopped session does nothing.
    ///
    /// # Errors
    /// Fails if the transport fails to disconnect. The session is stopped anyway.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        self.state = SessionState::Stopped;
        self.weight = RoundWeight::Unset;
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        info!(client = %self.id(), "session stopped");
        self.transport.disconnect().map_err(|source| {
            TransportError {
                operation: "disconnect",
                source,
            }
            .into()
        })
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        match (self.state, self.connected) {
            (SessionState::Stopped, _) => Err(self.invalid_state("use the transport")),
            (_, false) => Err(ClientError::NotStarted),
            _ => Ok(()),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ClientError {
        ClientError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn weight_of(&self, round: u32) -> Result<Weight, ClientError> {
        match self.weight {
            RoundWeight::Set { round: set, weight } if set == round => Ok(weight),
            _ => Err(WeightNotSetError { round }.into()),
        }
    }

    fn round_key(&self, round: u32) -> Result<RoundKey, ClientError> {
        self.identity
            .derive_round_key(round)
            .ok_or(ClientError::KeyUnavailable(round))
    }
}
