//! Pairwise key agreement and round key derivation.
//!
//! Every participant agrees on a secret with every other participant of the federation by
//! combining its own `C25519` secret key with the public key of the peer. The coordinator only
//! relays the public keys in a [`Roster`] and never holds any of the pairwise secrets. Every round
//! has its own [`RoundKey`], which holds one seed per peer, derived from the pairwise secret and
//! the round index. Both participants of a pair derive the same seed.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use sodiumoxide::crypto::box_;
use thiserror::Error;

use super::{hash::Sha256, ByteObject, EncryptKeyPair, PublicEncryptKey};
use crate::identity::ClientId;

const PAIR_SEED_DOMAIN: &[u8] = b"silo-client/pair-seed/v1";

/// The public keys of all the participants of a federation, the owner included.
pub type Roster = BTreeMap<ClientId, PublicEncryptKey>;

/// A source of per-round key material.
pub trait KeyService {
    /// Derives the key material of the given `round`.
    ///
    /// Returns `None` if no key material is available yet, i.e. before registration.
    fn derive_round_key(&self, round: u32) -> Option<RoundKey>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors related to the pairwise key agreement.
pub enum KeyAgreementError {
    #[error("the roster does not list `{0}`")]
    NotListed(ClientId),

    #[error("the roster lists a foreign public key for `{0}`")]
    ForeignKey(ClientId),

    #[error("the public key of `{0}` yields a degenerate shared secret")]
    DegenerateKey(ClientId),
}

/// The secrets a participant shares with each of its peers.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct PairwiseSecrets {
    owner: ClientId,
    shared: BTreeMap<ClientId, box_::PrecomputedKey>,
}

impl fmt::Debug for PairwiseSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairwiseSecrets")
            .field("owner", &self.owner)
            .field("peers", &self.shared.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PairwiseSecrets {
    /// Agrees on a secret with every peer of the `roster`.
    ///
    /// # Errors
    /// Fails if the roster does not list the `owner` with its own public key or if the public key
    /// of a peer is degenerate.
    pub fn agree(
        owner: &ClientId,
        keys: &EncryptKeyPair,
        roster: &Roster,
    ) -> Result<Self, KeyAgreementError> {
        match roster.get(owner) {
            None => return Err(KeyAgreementError::NotListed(owner.clone())),
            Some(pk) if pk != &keys.public => {
                return Err(KeyAgreementError::ForeignKey(owner.clone()))
            }
            Some(_) => {}
        }

        let shared = roster
            .iter()
            .filter(|(peer, _)| *peer != owner)
            .map(|(peer, pk)| {
                let key = box_::precompute(pk.as_ref(), keys.secret.as_ref());
                if key.0.iter().all(|byte| *byte == 0) {
                    Err(KeyAgreementError::DegenerateKey(peer.clone()))
                } else {
                    Ok((peer.clone(), key))
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            owner: owner.clone(),
            shared,
        })
    }

    /// Gets the owner of the secrets.
    pub fn owner(&self) -> &ClientId {
        &self.owner
    }

    /// Gets the number of peers.
    pub fn nb_peers(&self) -> usize {
        self.shared.len()
    }
}

impl KeyService for PairwiseSecrets {
    fn derive_round_key(&self, round: u32) -> Option<RoundKey> {
        let pair_seeds = self
            .shared
            .iter()
            .map(|(peer, key)| {
                let digest =
                    Sha256::hash_parts(&[PAIR_SEED_DOMAIN, &key.0, &round.to_le_bytes()]);
                // safe unwrap: the digest and the seed have the same length
                let seed = box_::Seed::from_slice(digest.as_slice()).unwrap();
                (peer.clone(), seed)
            })
            .collect();
        Some(RoundKey {
            round,
            owner: self.owner.clone(),
            pair_seeds,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
/// The key material of a participant for a single round: one seed per peer.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct RoundKey {
    round: u32,
    owner: ClientId,
    pair_seeds: BTreeMap<ClientId, box_::Seed>,
}

impl fmt::Debug for RoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundKey")
            .field("round", &self.round)
            .field("owner", &self.owner)
            .finish()
    }
}

impl RoundKey {
    /// Gets the round this key belongs to.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Gets the participant this key belongs to.
    pub fn owner(&self) -> &ClientId {
        &self.owner
    }

    /// Gets the peers of the owner.
    pub fn peers(&self) -> impl Iterator<Item = &ClientId> {
        self.pair_seeds.keys()
    }

    /// Gets the names of the whole federation, the owner included.
    pub fn roster(&self) -> BTreeSet<ClientId> {
        self.peers()
            .cloned()
            .chain(std::iter::once(self.owner.clone()))
            .collect()
    }

    pub(crate) fn pair_seed(&self, peer: &ClientId) -> Option<&box_::Seed> {
        self.pair_seeds.get(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn federation(names: &[&str]) -> (Roster, BTreeMap<ClientId, EncryptKeyPair>) {
        let keys: BTreeMap<_, _> = names
            .iter()
            .map(|name| (ClientId::from(*name), EncryptKeyPair::generate()))
            .collect();
        let roster = keys
            .iter()
            .map(|(id, keys)| (id.clone(), keys.public))
            .collect();
        (roster, keys)
    }

    #[test]
    fn test_pair_seeds_are_symmetric() {
        let (roster, keys) = federation(&["alice", "bob", "carol"]);
        let alice = ClientId::from("alice");
        let bob = ClientId::from("bob");
        let key_a = PairwiseSecrets::agree(&alice, &keys[&alice], &roster)
            .unwrap()
            .derive_round_key(3)
            .unwrap();
        let key_b = PairwiseSecrets::agree(&bob, &keys[&bob], &roster)
            .unwrap()
            .derive_round_key(3)
            .unwrap();
        assert_eq!(key_a.pair_seed(&bob), key_b.pair_seed(&alice));
        assert_ne!(
            key_a.pair_seed(&bob),
            key_a.pair_seed(&ClientId::from("carol"))
        );
        assert!(key_a.pair_seed(&alice).is_none());
        assert_eq!(key_a.roster(), roster.keys().cloned().collect());
    }

    #[test]
    fn test_round_keys_differ_per_round() {
        let (roster, keys) = federation(&["alice", "bob"]);
        let alice = ClientId::from("alice");
        let secrets = PairwiseSecrets::agree(&alice, &keys[&alice], &roster).unwrap();
        assert_eq!(secrets.nb_peers(), 1);
        assert_eq!(
            secrets.derive_round_key(1).unwrap(),
            secrets.derive_round_key(1).unwrap()
        );
        assert_ne!(
            secrets.derive_round_key(0).unwrap(),
            secrets.derive_round_key(1).unwrap()
        );
    }

    #[test]
    fn test_agree_checks_roster() {
        let (mut roster, keys) = federation(&["alice", "bob"]);
        let alice = ClientId::from("alice");
        let carol = ClientId::from("carol");
        assert_eq!(
            PairwiseSecrets::agree(&carol, &EncryptKeyPair::generate(), &roster).unwrap_err(),
            KeyAgreementError::NotListed(carol),
        );
        assert_eq!(
            PairwiseSecrets::agree(&alice, &keys[&ClientId::from("bob")], &roster).unwrap_err(),
            KeyAgreementError::ForeignKey(alice.clone()),
        );
        roster.insert(ClientId::from("bob"), PublicEncryptKey::zeroed());
        assert_eq!(
            PairwiseSecrets::agree(&alice, &keys[&alice], &roster).unwrap_err(),
            KeyAgreementError::DegenerateKey(ClientId::from("bob")),
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let (roster, keys) = federation(&["alice", "bob"]);
        let alice = ClientId::from("alice");
        let secrets = PairwiseSecrets::agree(&alice, &keys[&alice], &roster).unwrap();
        assert_eq!(
            format!("{:?}", secrets),
            r#"PairwiseSecrets { owner: ClientId("alice"), peers: [ClientId("bob")] }"#
        );
        let key = secrets.derive_round_key(5).unwrap();
        assert_eq!(
            format!("{:?}", key),
            r#"RoundKey { round: 5, owner: ClientId("alice") }"#
        );
    }
}
