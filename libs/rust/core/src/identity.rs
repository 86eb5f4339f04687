//! Node identity: Ed25519 key material and the peer id derived from it.
//!
//! A `PeerId` is the node's public key, so any peer can check a signature
//! against the claimed signer without a separate key directory.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("peer id must be {expected} hex encoded bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("peer id is not valid hex: {0}")]
    InvalidHex(String),
    #[error("peer id is not a valid ed25519 public key")]
    InvalidKey,
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerId([u8; PUBLIC_KEY_LENGTH]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self { Self(bytes) }
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] { &self.0 }

    /// Public key this identity stands for.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| IdentityError::InvalidKey)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String { hex::encode(&self.0[..4]) }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str(&hex::encode(self.0)) }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength { expected: PUBLIC_KEY_LENGTH, got: raw.len() })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct PeerIdVisitor;

impl<'de> Visitor<'de> for PeerIdVisitor {
    type Value = PeerId;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str("a hex encoded peer id") }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<PeerId, E> { v.parse().map_err(E::custom) }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(PeerIdVisitor)
    }
}

/// Signing half of a node identity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self { signing: SigningKey::generate(&mut csprng) }
    }

    /// Deterministic key from a 32 byte seed; used by tests and local clusters.
    pub fn from_seed(seed: [u8; 32]) -> Self { Self { signing: SigningKey::from_bytes(&seed) } }

    pub fn peer_id(&self) -> PeerId { PeerId(self.signing.verifying_key().to_bytes()) }

    pub fn sign(&self, msg: &[u8]) -> Signature { self.signing.sign(msg) }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("peer_id", &self.peer_id()).finish_non_exhaustive()
    }
}
