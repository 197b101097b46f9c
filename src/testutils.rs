//! Helpers shared by the unit tests.

use std::collections::BTreeMap;

use crate::{
    crypto::{EncryptKeyPair, KeyService, PairwiseSecrets, RoundKey, Roster},
    identity::ClientId,
};

/// Generates a key pair for each of the given participants.
pub fn key_pairs(names: &[&str]) -> BTreeMap<ClientId, EncryptKeyPair> {
    names
        .iter()
        .map(|name| (ClientId::from(*name), EncryptKeyPair::generate()))
        .collect()
}

/// Gets the roster of the given key pairs.
pub fn roster(keys: &BTreeMap<ClientId, EncryptKeyPair>) -> Roster {
    keys.iter()
        .map(|(id, keys)| (id.clone(), keys.public))
        .collect()
}

/// Derives the round keys of every participant of a fresh federation.
pub fn round_keys(names: &[&str], round: u32) -> BTreeMap<ClientId, RoundKey> {
    let keys = key_pairs(names);
    let roster = roster(&keys);
    keys.iter()
        .map(|(id, keys)| {
            let key = PairwiseSecrets::agree(id, keys, &roster)
                .unwrap()
                .derive_round_key(round)
                .unwrap();
            (id.clone(), key)
        })
        .collect()
}

/// Derives the round key of a participant without any peer.
pub fn solo_key(name: &str, round: u32) -> RoundKey {
    round_keys(&[name], round)
        .remove(&ClientId::from(name))
        .unwrap()
}
