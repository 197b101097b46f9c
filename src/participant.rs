//! The round loop of a participant.
//!
//! A [`Participant`] drives a [`ClientSession`] and a [`TrainingStep`] through the configured
//! number of rounds:
//!
//! 1. fetch the aggregate of round `r`
//! 2. decrypt it into the weighted global model and keep a copy of it
//! 3. train on the global model
//! 4. weight and encrypt the update for round `r + 1`, then check that it decrypts back
//! 5. write the payload file and send it
//!
//! There are no retries: the first failure aborts the loop, stops the session and is reported
//! together with its round and phase.

use std::path::PathBuf;

use derive_more::Display;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    payload::write_parameters,
    session::{ClientError, ClientSession, TrainingStepFailure},
    training::{RoundConfig, TrainingStep},
    transport::Transport,
    weight::Weight,
};

#[derive(Debug, Clone, PartialEq)]
/// The round settings of a participant.
pub struct ParticipantSettings {
    /// The number of rounds to take part in.
    pub iterations: u32,
    /// The round of the first aggregate to fetch.
    pub start_round: u32,
    /// The aggregation weight of this participant.
    pub weight: Weight,
    /// The number of local epochs per round.
    pub local_epochs: u32,
    /// The directory the outbound payloads and the global models are written to.
    pub models_dir: PathBuf,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The phase of a round.
pub enum RoundPhase {
    #[display(fmt = "fetch")]
    Fetch,
    #[display(fmt = "decrypt")]
    Decrypt,
    #[display(fmt = "train")]
    Train,
    #[display(fmt = "encrypt")]
    Encrypt,
    #[display(fmt = "send")]
    Send,
}

#[derive(Debug, Error)]
#[error("round {round} failed during {phase}: {source}")]
/// A failed round.
pub struct RoundError {
    pub round: u32,
    pub phase: RoundPhase,
    #[source]
    pub source: ClientError,
}

#[derive(Debug, Error)]
/// Errors of the round loop.
pub enum ParticipantError {
    #[error("the session could not be set up: {0}")]
    Setup(#[source] ClientError),

    #[error("{iterations} rounds starting at round {start_round} exceed the last round")]
    RoundOverflow { start_round: u32, iterations: u32 },

    #[error(transparent)]
    Round(#[from] RoundError),
}

/// A participant of a federation.
pub struct Participant<T, S> {
    session: ClientSession<T>,
    trainer: S,
    settings: ParticipantSettings,
}

impl<T, S> Participant<T, S>
where
    T: Transport,
    S: TrainingStep,
{
    /// Creates a participant.
    pub fn new(session: ClientSession<T>, trainer: S, settings: ParticipantSettings) -> Self {
        Self {
            session,
            trainer,
            settings,
        }
    }

    /// Gets the session.
    pub fn session(&self) -> &ClientSession<T> {
        &self.session
    }

    /// Gets the training step.
    pub fn trainer(&self) -> &S {
        &self.trainer
    }

    /// Gets the path of the outbound payload of the given round.
    pub fn payload_path(&self, round: u32) -> PathBuf {
        self.settings
            .models_dir
            .join(format!("model_param_{}_r{}.bin", self.session.id(), round))
    }

    /// Gets the path of the decrypted global model of the given round.
    pub fn current_model_path(&self, round: u32) -> PathBuf {
        self.settings
            .models_dir
            .join(format!("{}_current_r{}.bin", self.session.id(), round))
    }

    /// Starts the session, registers and runs all the rounds, then stops the session.
    ///
    /// # Errors
    /// Fails on the first failing round, if the session cannot be set up or if the rounds would run
    /// past the last round. The session is stopped in any case.
    pub fn run(&mut self) -> Result<(), ParticipantError> {
        let result = self.run_rounds();
        if let Err(ref error) = result {
            error!("{}", error);
        }
        if let Err(error) = self.session.stop() {
            warn!("failed to stop the session: {}", error);
        }
        result
    }

    fn run_rounds(&mut self) -> Result<(), ParticipantError> {
        let ParticipantSettings {
            iterations,
            start_round,
            ..
        } = self.settings;
        // the last update is sent for the round after the last fetched one
        let end_round = start_round
            .checked_add(iterations)
            .ok_or(ParticipantError::RoundOverflow {
                start_round,
                iterations,
            })?;

        self.session.start().map_err(ParticipantError::Setup)?;
        self.session.register().map_err(ParticipantError::Setup)?;
        info!(iterations, start_round, "starting round loop");
        for (iteration, round) in (0..iterations).zip(start_round..end_round) {
            self.run_round(round, iteration)?;
        }
        info!("round loop done");
        Ok(())
    }

    /// Runs a single round: fetches the aggregate of `round` and sends the update for `round + 1`.
    ///
    /// # Errors
    /// Fails if any phase of the round fails.
    pub fn run_round(&mut self, round: u32, iteration: u32) -> Result<(), RoundError> {
        let fail = |phase: RoundPhase| move |source: ClientError| RoundError {
            round,
            phase,
            source,
        };

        info!(round, iteration, "round started");
        let inbound = self.session.fetch(round).map_err(fail(RoundPhase::Fetch))?;
        let global = self
            .session
            .global_model(inbound)
            .map_err(fail(RoundPhase::Decrypt))?;
        write_parameters(self.current_model_path(round), &global)
            .map_err(|error| fail(RoundPhase::Decrypt)(error.into()))?;

        let config = RoundConfig {
            round,
            iteration,
            local_epochs: self.settings.local_epochs,
        };
        let trained = self
            .trainer
            .train(global, &config)
            .map_err(|source| ClientError::from(TrainingStepFailure { round, source }))
            .map_err(fail(RoundPhase::Train))?;

        self.session
            .set_weight(self.settings.weight)
            .map_err(fail(RoundPhase::Encrypt))?;
        let outbound = self
            .session
            .seal_update(&trained)
            .map_err(fail(RoundPhase::Encrypt))?;
        self.session
            .verify_update(&outbound, &trained)
            .map_err(fail(RoundPhase::Encrypt))?;

        let next_round = outbound.model_state.round();
        let path = self.payload_path(next_round);
        outbound
            .write(&path)
            .map_err(|error| fail(RoundPhase::Send)(error.into()))?;
        self.session
            .send_model(&path, next_round)
            .map_err(fail(RoundPhase::Send))?;
        info!(round, "round done");
        Ok(())
    }
}
