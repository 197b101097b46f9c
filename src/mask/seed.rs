//! Mask seed and mask generation.
//!
//! See the [mask module] documentation since this is a private module anyways.
//!
//! [mask module]: crate::mask

use std::{collections::BTreeMap, fmt, iter};

use num::bigint::BigUint;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sodiumoxide::crypto::box_;

use crate::{
    crypto::{generate_integer, RoundKey},
    identity::ClientId,
    mask::{config::MaskConfig, model::ParameterSchema},
};

/// The random group elements masking each tensor, keyed by tensor name.
pub type Mask = BTreeMap<String, Vec<BigUint>>;

#[derive(Clone, PartialEq, Eq)]
/// A seed to generate a mask.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct MaskSeed(box_::Seed);

impl fmt::Debug for MaskSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MaskSeed(..)")
    }
}

impl MaskSeed {
    /// Length in bytes of a mask seed.
    pub const LENGTH: usize = box_::SEEDBYTES;

    /// Gets the seed of the mask shared by the owner of the `key` and the `peer` in the round of
    /// the `key`.
    ///
    /// Returns `None` if the `peer` is not a peer of the owner.
    pub(crate) fn pairwise(key: &RoundKey, peer: &ClientId) -> Option<Self> {
        key.pair_seed(peer).cloned().map(Self)
    }

    /// Gets this seed as an array.
    fn as_array(&self) -> [u8; Self::LENGTH] {
        (self.0).0
    }

    /// Derives a mask for the tensors of the `schema` from this seed wrt the masking configuration.
    ///
    /// The random elements are drawn from a single stream, tensor after tensor in name order and
    /// element after element in logical order.
    pub fn derive_mask(&self, schema: &ParameterSchema, config: &MaskConfig) -> Mask {
        let order = config.order();
        let mut prng = ChaCha20Rng::from_seed(self.as_array());
        schema
            .iter()
            .map(|(name, shape)| {
                let len = shape.iter().product();
                let ints = iter::repeat_with(|| generate_integer(&mut prng, &order))
                    .take(len)
                    .collect();
                (name.clone(), ints)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptKeyPair, KeyService, PairwiseSecrets, Roster};

    fn schema() -> ParameterSchema {
        ParameterSchema::new(vec![("fc.weight", vec![2, 3]), ("fc.bias", vec![3])])
    }

    fn round_keys(round: u32) -> (RoundKey, RoundKey) {
        let alice = (ClientId::from("alice"), EncryptKeyPair::generate());
        let bob = (ClientId::from("bob"), EncryptKeyPair::generate());
        let roster: Roster = vec![(alice.0.clone(), alice.1.public), (bob.0.clone(), bob.1.public)]
            .into_iter()
            .collect();
        let derive = |(id, keys): &(ClientId, EncryptKeyPair)| {
            PairwiseSecrets::agree(id, keys, &roster)
                .unwrap()
                .derive_round_key(round)
                .unwrap()
        };
        (derive(&alice), derive(&bob))
    }

    #[test]
    fn test_derive_mask() {
        let config = MaskConfig::default();
        let (key, _) = round_keys(0);
        let seed = MaskSeed::pairwise(&key, &ClientId::from("bob")).unwrap();
        let mask = seed.derive_mask(&schema(), &config);
        assert_eq!(mask["fc.weight"].len(), 6);
        assert_eq!(mask["fc.bias"].len(), 3);
        assert!(mask
            .values()
            .flatten()
            .all(|integer| integer < &config.order()));
        assert_eq!(mask, seed.derive_mask(&schema(), &config));
    }

    #[test]
    fn test_both_peers_share_the_seed() {
        let (key_a, key_b) = round_keys(1);
        let alice = ClientId::from("alice");
        let bob = ClientId::from("bob");
        assert_eq!(
            MaskSeed::pairwise(&key_a, &bob),
            MaskSeed::pairwise(&key_b, &alice)
        );
        assert!(MaskSeed::pairwise(&key_a, &alice).is_none());
        assert!(MaskSeed::pairwise(&key_a, &ClientId::from("carol")).is_none());
    }

    #[test]
    fn test_debug_is_redacted() {
        let (key, _) = round_keys(0);
        let seed = MaskSeed::pairwise(&key, &ClientId::from("bob")).unwrap();
        assert_eq!(format!("{:?}", seed), "MaskSeed(..)");
    }
}
