//! Wrappers around the [sodiumoxide] `C25519` key pair.
//!
//! A participant generates a `C25519` key pair when its identity is created. The public key is
//! sent to the coordinator during registration, which relays it to the other participants of the
//! federation for the pairwise key agreement.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/
//! [crypto module]: crate::crypto

use derive_more::{AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::box_;

use super::ByteObject;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `C25519` key pair for asymmetric encryption.
pub struct EncryptKeyPair {
    /// The `C25519` public key.
    pub public: PublicEncryptKey,
    /// The `C25519` secret key.
    pub secret: SecretEncryptKey,
}

impl EncryptKeyPair {
    /// Generates a new random `C25519` key pair for encryption.
    pub fn generate() -> Self {
        let (pk, sk) = box_::gen_keypair();
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Hash, Eq, Ord, PartialEq, Copy, Clone, PartialOrd, Debug)]
/// A `C25519` public key for asymmetric encryption.
pub struct PublicEncryptKey(box_::PublicKey);

impl ByteObject for PublicEncryptKey {
    const LENGTH: usize = box_::PUBLICKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::PublicKey([0_u8; box_::PUBLICKEYBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(AsRef, From, Eq, PartialEq, Clone)]
/// A `C25519` secret key for asymmetric encryption.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretEncryptKey(box_::SecretKey);

impl std::fmt::Debug for SecretEncryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretEncryptKey(..)")
    }
}

impl SecretEncryptKey {
    /// Computes the corresponding public key for this secret key.
    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey(self.0.public_key())
    }
}

impl ByteObject for SecretEncryptKey {
    const LENGTH: usize = box_::SECRETKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::SecretKey([0_u8; box_::SECRETKEYBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::SecretKey::from_slice(bytes).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_debug() {
        let keys = EncryptKeyPair::generate();
        assert_eq!(format!("{:?}", keys.secret), "SecretEncryptKey(..)");
    }

    #[test]
    fn test_public_key() {
        let keys = EncryptKeyPair::generate();
        assert_eq!(keys.secret.public_key(), keys.public);
    }
}
