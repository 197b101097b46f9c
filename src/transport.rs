//! The channel to the coordinator.
//!
//! How payload files travel is up to the implementor: a shared file system, an object store or a
//! message queue all fit, as long as files are keyed by round and participant. Errors are opaque
//! to the session and only ever reported.

use std::path::{Path, PathBuf};

use derive_more::Display;

use crate::{
    crypto::{PublicEncryptKey, Roster},
    identity::ClientId,
};

#[derive(Debug, Display, Clone, PartialEq, Eq)]
/// The reason why a coordinator refused a registration.
pub enum RejectReason {
    #[display(fmt = "the name is already taken")]
    DuplicateName,
    #[display(fmt = "the participant is unknown to the federation")]
    UnknownClient,
    #[display(fmt = "{}", _0)]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The answer of a coordinator to a registration.
pub enum RegistrationResponse {
    /// The public keys of every participant of the federation, the registering one included.
    Accepted(Roster),
    /// The registration was refused.
    Rejected(RejectReason),
}

#[cfg_attr(test, mockall::automock)]
/// The operations a participant needs from its channel to the coordinator.
pub trait Transport {
    /// Opens the channel.
    fn connect(&mut self) -> anyhow::Result<()>;

    /// Announces the participant and its public key.
    ///
    /// Blocks until the federation is complete and relays the public keys of all its members.
    /// The coordinator never hands out any secret.
    fn register(
        &mut self,
        client: &ClientId,
        public_key: &PublicEncryptKey,
    ) -> anyhow::Result<RegistrationResponse>;

    /// Blocks until the aggregate of the given round is available and returns the path of the
    /// local copy of its payload.
    fn fetch(&mut self, round: u32, client: &ClientId) -> anyhow::Result<PathBuf>;

    /// Hands the payload at `path` to the coordinator as the contribution to the given round.
    fn deliver(&mut self, path: &Path, round: u32, client: &ClientId) -> anyhow::Result<()>;

    /// Closes the channel.
    fn disconnect(&mut self) -> anyhow::Result<()>;
}
