//! Request digests and message signatures.
//!
//! A signature covers the SHA-256 of the message serialized with its
//! `signature` field emptied, and is carried hex encoded.

use ed25519_dalek::{Signature, Verifier};
use mesh_core::{Keypair, PeerId};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, Result};
use crate::message::{Commit, NewView, PrePrepare, Prepare, Request, ViewChange};

/// Content address of a request. Every replica must derive the same value,
/// so this relies on the fixed field order of `Request`.
pub fn request_digest(request: &Request) -> Result<String> {
    let bytes = serde_json::to_vec(request)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub trait Signable: Serialize + Clone {
    fn signature(&self) -> &str;
    fn set_signature(&mut self, signature: String);
}

macro_rules! impl_signable {
    ($($ty:ty),+ $(,)?) => {
        $(impl Signable for $ty {
            fn signature(&self) -> &str { &self.signature }
            fn set_signature(&mut self, signature: String) { self.signature = signature; }
        })+
    };
}

impl_signable!(PrePrepare, Prepare, Commit, ViewChange, NewView);

fn signing_digest<T: Signable>(msg: &T) -> Result<[u8; 32]> {
    let mut unsigned = msg.clone();
    unsigned.set_signature(String::new());
    let bytes = serde_json::to_vec(&unsigned)?;
    Ok(Sha256::digest(&bytes).into())
}

pub fn sign<T: Signable>(msg: &mut T, key: &Keypair) -> Result<()> {
    let digest = signing_digest(msg)?;
    msg.set_signature(hex::encode(key.sign(&digest).to_bytes()));
    Ok(())
}

pub fn verify_signature<T: Signable>(msg: &T, signer: &PeerId) -> Result<()> {
    let raw = hex::decode(msg.signature()).map_err(|e| ConsensusError::MalformedSignature(e.to_string()))?;
    let signature = Signature::from_slice(&raw).map_err(|e| ConsensusError::MalformedSignature(e.to_string()))?;
    let key = signer.verifying_key()?;
    let digest = signing_digest(msg)?;
    key.verify(&digest, &signature).map_err(|_| ConsensusError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionRequest;

    fn key(seed: u8) -> Keypair { Keypair::from_seed([seed; 32]) }

    fn request() -> Request {
        Request::new(key(1).peer_id(), ExecutionRequest::new("fn-a", "run").with_parameter("n", "3"))
    }

    #[test]
    fn digest_is_deterministic_and_field_sensitive() {
        let r = request();
        assert_eq!(request_digest(&r).unwrap(), request_digest(&r).unwrap());
        assert_eq!(request_digest(&r).unwrap().len(), 64);

        let mut other = r.clone();
        other.execute.method = "walk".into();
        assert_ne!(request_digest(&r).unwrap(), request_digest(&other).unwrap());

        let mut other = r.clone();
        other.id.push('x');
        assert_ne!(request_digest(&r).unwrap(), request_digest(&other).unwrap());
    }

    #[test]
    fn signed_message_verifies_for_signer_only() {
        let signer = key(2);
        let mut prepare = Prepare { view: 0, sequence: 1, digest: "abc".into(), signature: String::new() };
        sign(&mut prepare, &signer).unwrap();
        assert_eq!(prepare.signature.len(), 128);
        verify_signature(&prepare, &signer.peer_id()).unwrap();
        assert!(matches!(verify_signature(&prepare, &key(3).peer_id()), Err(ConsensusError::InvalidSignature)));
    }

    #[test]
    fn tampering_breaks_signature() {
        let signer = key(4);
        let mut commit = Commit { view: 2, sequence: 5, digest: "abc".into(), signature: String::new() };
        sign(&mut commit, &signer).unwrap();
        let mut tampered = commit.clone();
        tampered.sequence = 6;
        assert!(matches!(verify_signature(&tampered, &signer.peer_id()), Err(ConsensusError::InvalidSignature)));
        let mut tampered = commit;
        tampered.digest = "abd".into();
        assert!(matches!(verify_signature(&tampered, &signer.peer_id()), Err(ConsensusError::InvalidSignature)));
    }

    #[test]
    fn undecodable_signature_is_malformed() {
        let mut prepare = Prepare { view: 0, sequence: 1, digest: "abc".into(), signature: "zz".into() };
        assert!(matches!(verify_signature(&prepare, &key(5).peer_id()), Err(ConsensusError::MalformedSignature(_))));
        prepare.signature = "abcd".into();
        assert!(matches!(verify_signature(&prepare, &key(5).peer_id()), Err(ConsensusError::MalformedSignature(_))));
    }

    #[test]
    fn pre_prepare_signature_covers_request() {
        let signer = key(6);
        let req = request();
        let digest = request_digest(&req).unwrap();
        let mut pp = PrePrepare { view: 0, sequence: 1, digest, request: req, signature: String::new() };
        sign(&mut pp, &signer).unwrap();
        verify_signature(&pp, &signer.peer_id()).unwrap();
        pp.request.execute.parameters.clear();
        assert!(verify_signature(&pp, &signer.peer_id()).is_err());
    }
}
