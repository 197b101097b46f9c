//! The payload files exchanged with the coordinator.
//!
//! A payload is a `bincode` encoded map of named entries. An outbound payload carries the
//! encrypted parameters of a participant and its weight, an inbound payload carries the encrypted
//! aggregate, the sum of the weights and the number of aggregated participants.
//!
//! The plaintext global model of every round is kept next to the payloads as a `bincode` encoded
//! [`ParameterSet`].

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mask::{EncryptedModelState, InvalidMaskObjectError, ParameterSet, SchemaError};

/// The key of the encrypted parameters.
pub const MODEL_STATE_KEY: &str = "model_state_dict";
/// The key of the weight of a participant.
pub const CLIENT_WEIGHT_KEY: &str = "client_weight";
/// The key of the sum of the weights of the aggregated participants.
pub const WEIGHT_SUM_KEY: &str = "weight_sum";
/// The key of the number of aggregated participants.
pub const CLIENT_NUM_KEY: &str = "client_num";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// A single entry of a payload.
pub enum PayloadEntry {
    ModelState(EncryptedModelState),
    Scalar(f64),
    Count(u32),
}

impl PayloadEntry {
    fn kind(&self) -> &'static str {
        match self {
            Self::ModelState(_) => "model state",
            Self::Scalar(_) => "scalar",
            Self::Count(_) => "count",
        }
    }
}

type Entries = BTreeMap<String, PayloadEntry>;

#[derive(Debug, Error)]
/// Errors related to malformed payloads.
///
/// No partial data is ever returned from a malformed payload.
pub enum CorruptPayloadError {
    #[error("the payload could not be read: {0}")]
    Io(#[from] io::Error),

    #[error("the payload container could not be decoded: {0}")]
    Decode(#[from] bincode::Error),

    #[error("the payload entry `{0}` is missing")]
    MissingEntry(&'static str),

    #[error("the payload entry `{key}` is a {actual} instead of a {expected}")]
    WrongKind {
        key: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("the payload entry `{0}` is not expected")]
    UnexpectedEntry(String),

    #[error("the payload entry `{key}` holds the invalid weight {value}")]
    InvalidWeight { key: &'static str, value: f64 },

    #[error("the payload counts {client_num} participants but the model state holds {contributions} contributions")]
    CountMismatch { client_num: u32, contributions: u64 },

    #[error("the payload model state is invalid: {0}")]
    InvalidModelState(#[from] InvalidMaskObjectError),

    #[error("the payload model state does not match the schema: {0}")]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
/// Errors related to writing payloads.
pub enum PayloadWriteError {
    #[error("the payload could not be written: {0}")]
    Io(#[from] io::Error),

    #[error("the payload could not be encoded: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Clone, Debug, PartialEq)]
/// The payload a participant receives: the encrypted aggregate of a round.
pub struct InboundPayload {
    pub model_state: EncryptedModelState,
    pub weight_sum: f64,
    pub client_num: u32,
}

#[derive(Clone, Debug, PartialEq)]
/// The payload a participant sends: its encrypted, weighted parameters.
pub struct OutboundPayload {
    pub model_state: EncryptedModelState,
    pub client_weight: f64,
}

impl InboundPayload {
    /// Reads an inbound payload from a file.
    ///
    /// # Errors
    /// Fails if the file is unreadable or any entry is missing, of the wrong kind or
    /// inconsistent.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, CorruptPayloadError> {
        Self::from_entries(read_entries(path.as_ref())?)
    }

    /// Writes this payload to a file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), PayloadWriteError> {
        let mut entries = Entries::new();
        entries.insert(
            MODEL_STATE_KEY.into(),
            PayloadEntry::ModelState(self.model_state.clone()),
        );
        entries.insert(WEIGHT_SUM_KEY.into(), PayloadEntry::Scalar(self.weight_sum));
        entries.insert(CLIENT_NUM_KEY.into(), PayloadEntry::Count(self.client_num));
        write_entries(path.as_ref(), &entries)
    }

    fn from_entries(mut entries: Entries) -> Result<Self, CorruptPayloadError> {
        let model_state = take_model_state(&mut entries)?;
        let weight_sum = take_weight(&mut entries, WEIGHT_SUM_KEY)?;
        let client_num = match take(&mut entries, CLIENT_NUM_KEY)? {
            PayloadEntry::Count(count) => count,
            other => return Err(wrong_kind(CLIENT_NUM_KEY, "count", &other)),
        };
        reject_remaining(entries)?;

        if u64::from(client_num) != model_state.contributions() {
            return Err(CorruptPayloadError::CountMismatch {
                client_num,
                contributions: model_state.contributions(),
            });
        }
        Ok(Self {
            model_state,
            weight_sum,
            client_num,
        })
    }
}

impl OutboundPayload {
    /// Reads an outbound payload from a file.
    ///
    /// # Errors
    /// Fails if the file is unreadable or any entry is missing, of the wrong kind or
    /// inconsistent.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, CorruptPayloadError> {
        Self::from_entries(read_entries(path.as_ref())?)
    }

    /// Writes this payload to a file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), PayloadWriteError> {
        let mut entries = Entries::new();
        entries.insert(
            MODEL_STATE_KEY.into(),
            PayloadEntry::ModelState(self.model_state.clone()),
        );
        entries.insert(
            CLIENT_WEIGHT_KEY.into(),
            PayloadEntry::Scalar(self.client_weight),
        );
        write_entries(path.as_ref(), &entries)
    }

    fn from_entries(mut entries: Entries) -> Result<Self, CorruptPayloadError> {
        let model_state = take_model_state(&mut entries)?;
        let client_weight = take_weight(&mut entries, CLIENT_WEIGHT_KEY)?;
        reject_remaining(entries)?;
        if model_state.contributions() != 1 {
            return Err(CorruptPayloadError::CountMismatch {
                client_num: 1,
                contributions: model_state.contributions(),
            });
        }
        Ok(Self {
            model_state,
            client_weight,
        })
    }
}

/// Writes a plaintext parameter set to a file.
pub fn write_parameters(
    path: impl AsRef<Path>,
    params: &ParameterSet,
) -> Result<(), PayloadWriteError> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, params)?;
    writer.flush()?;
    Ok(())
}

/// Reads a plaintext parameter set from a file.
///
/// # Errors
/// Fails if the file is unreadable or doesn't hold a parameter set.
pub fn read_parameters(path: impl AsRef<Path>) -> Result<ParameterSet, CorruptPayloadError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

fn read_entries(path: &Path) -> Result<Entries, CorruptPayloadError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), PayloadWriteError> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, entries)?;
    writer.flush()?;
    Ok(())
}

fn take(entries: &mut Entries, key: &'static str) -> Result<PayloadEntry, CorruptPayloadError> {
    entries
        .remove(key)
        .ok_or(CorruptPayloadError::MissingEntry(key))
}

fn take_model_state(entries: &mut Entries) -> Result<EncryptedModelState, CorruptPayloadError> {
    match take(entries, MODEL_STATE_KEY)? {
        PayloadEntry::ModelState(state) => {
            state.validate()?;
            Ok(state)
        }
        other => Err(wrong_kind(MODEL_STATE_KEY, "model state", &other)),
    }
}

fn take_weight(entries: &mut Entries, key: &'static str) -> Result<f64, CorruptPayloadError> {
    match take(entries, key)? {
        PayloadEntry::Scalar(value) if value.is_finite() && value > 0.0 => Ok(value),
        PayloadEntry::Scalar(value) => Err(CorruptPayloadError::InvalidWeight { key, value }),
        other => Err(wrong_kind(key, "scalar", &other)),
    }
}

fn reject_remaining(entries: Entries) -> Result<(), CorruptPayloadError> {
    match entries.into_iter().next() {
        Some((key, _)) => Err(CorruptPayloadError::UnexpectedEntry(key)),
        None => Ok(()),
    }
}

fn wrong_kind(
    key: &'static str,
    expected: &'static str,
    actual: &PayloadEntry,
) -> CorruptPayloadError {
    CorruptPayloadError::WrongKind {
        key,
        expected,
        actual: actual.kind(),
    }
}
