//! The identity of a participant.

use std::fmt;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{
    EncryptKeyPair, KeyAgreementError, KeyService, PairwiseSecrets, PublicEncryptKey, RoundKey,
    Roster,
};

#[derive(
    Clone, Debug, Display, From, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
/// The stable name of a participant.
pub struct ClientId(String);

impl From<&str> for ClientId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl ClientId {
    /// Gets the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
#[error("failed to initialize the crypto library")]
/// An error related to the initialization of the crypto library.
pub struct InitError;

/// A participant's identity: its name, its encryption key pair and, once registered, the secrets
/// it shares with each of the other participants.
pub struct ClientIdentity {
    id: ClientId,
    keys: EncryptKeyPair,
    secrets: Option<PairwiseSecrets>,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("id", &self.id)
            .field("public_key", &self.keys.public)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl ClientIdentity {
    /// Creates a new identity with a fresh encryption key pair.
    ///
    /// # Errors
    /// Fails if the crypto library cannot be initialized.
    pub fn new(id: impl Into<ClientId>) -> Result<Self, InitError> {
        sodiumoxide::init().map_err(|_| InitError)?;
        Ok(Self {
            id: id.into(),
            keys: EncryptKeyPair::generate(),
            secrets: None,
        })
    }

    /// Gets the name of the participant.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Gets the public key the coordinator relays to the peers.
    pub fn public_key(&self) -> &PublicEncryptKey {
        &self.keys.public
    }

    /// Checks whether the pairwise secrets have been agreed on.
    pub fn is_registered(&self) -> bool {
        self.secrets.is_some()
    }

    /// Agrees on a secret with every peer of the `roster` and keeps the secrets.
    ///
    /// # Errors
    /// Fails if the roster does not list this identity with its own public key or if a peer key
    /// is degenerate. The identity is left unchanged in that case.
    pub fn accept_roster(&mut self, roster: &Roster) -> Result<(), KeyAgreementError> {
        self.secrets = Some(PairwiseSecrets::agree(&self.id, &self.keys, roster)?);
        Ok(())
    }
}

impl KeyService for ClientIdentity {
    fn derive_round_key(&self, round: u32) -> Option<RoundKey> {
        self.secrets
            .as_ref()
            .and_then(|secrets| secrets.derive_round_key(round))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id() {
        let id = ClientId::from("alice");
        assert_eq!(id.as_str(), "alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(ClientId::from("alice".to_string()), id);
    }

    fn roster(identities: &[&ClientIdentity]) -> Roster {
        identities
            .iter()
            .map(|identity| (identity.id().clone(), *identity.public_key()))
            .collect()
    }

    #[test]
    fn test_accept_roster() {
        let mut alice = ClientIdentity::new("alice").unwrap();
        let mut bob = ClientIdentity::new("bob").unwrap();
        assert!(!alice.is_registered());
        assert!(alice.derive_round_key(0).is_none());

        let roster = roster(&[&alice, &bob]);
        alice.accept_roster(&roster).unwrap();
        bob.accept_roster(&roster).unwrap();
        assert!(alice.is_registered());

        let key_a = alice.derive_round_key(2).unwrap();
        let key_b = bob.derive_round_key(2).unwrap();
        assert_eq!(key_a.owner(), alice.id());
        assert_eq!(key_a.roster(), key_b.roster());
        assert_eq!(key_a.pair_seed(bob.id()), key_b.pair_seed(alice.id()));
    }

    #[test]
    fn test_reject_foreign_roster() {
        let mut alice = ClientIdentity::new("alice").unwrap();
        let bob = ClientIdentity::new("bob").unwrap();
        let mut roster = roster(&[&bob]);
        assert_eq!(
            alice.accept_roster(&roster),
            Err(KeyAgreementError::NotListed(alice.id().clone())),
        );
        roster.insert(alice.id().clone(), *bob.public_key());
        assert_eq!(
            alice.accept_roster(&roster),
            Err(KeyAgreementError::ForeignKey(alice.id().clone())),
        );
        assert!(!alice.is_registered());
    }

    #[test]
    fn test_debug_is_redacted() {
        let identity = ClientIdentity::new("alice").unwrap();
        let debug = format!("{:?}", identity);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("secret"));
    }
}
