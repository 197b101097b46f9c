//! Wrappers around the [sodiumoxide] primitives used by a participant.
//!
//! The wrappers provide methods defined on structs instead of the sodiumoxide functions. This is
//! done for the `C25519` key pair used for the pairwise key agreement, the `SHA256` hash function
//! used for key derivation and the pairwise secrets from which the round keys are derived.
//!
//! # Examples
//! ## Agreeing on pairwise round keys
//! ```
//! # use std::collections::BTreeMap;
//! # use silo_client::{crypto::{EncryptKeyPair, KeyService, PairwiseSecrets}, ClientId};
//! let alice = (ClientId::from("alice"), EncryptKeyPair::generate());
//! let bob = (ClientId::from("bob"), EncryptKeyPair::generate());
//! let roster: BTreeMap<_, _> = vec![(alice.0.clone(), alice.1.public), (bob.0.clone(), bob.1.public)]
//!     .into_iter()
//!     .collect();
//!
//! let secrets = PairwiseSecrets::agree(&alice.0, &alice.1, &roster).unwrap();
//! let key = secrets.derive_round_key(1).unwrap();
//! assert_eq!(key.peers().collect::<Vec<_>>(), vec![&bob.0]);
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod encrypt;
pub(crate) mod hash;
pub(crate) mod keys;
pub(crate) mod prng;

use sodiumoxide::randombytes::randombytes;

pub use self::{
    encrypt::{EncryptKeyPair, PublicEncryptKey, SecretEncryptKey},
    hash::Sha256,
    keys::{KeyAgreementError, KeyService, PairwiseSecrets, RoundKey, Roster},
    prng::generate_integer,
};

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object
    const LENGTH: usize;

    /// Creates a new object with all the bytes initialized to `0`.
    fn zeroed() -> Self;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Creates an object from the given buffer.
    ///
    /// # Panics
    /// Panics if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice_unchecked(bytes: &[u8]) -> Self {
        Self::from_slice(bytes).unwrap()
    }

    /// Generates an object with random bytes
    fn generate() -> Self {
        // safe unwrap: length of slice is guaranteed by constants
        Self::from_slice_unchecked(randombytes(Self::LENGTH).as_slice())
    }

    /// A helper for instantiating an object filled with the given value
    fn fill_with(value: u8) -> Self {
        Self::from_slice_unchecked(&vec![value; Self::LENGTH])
    }
}
