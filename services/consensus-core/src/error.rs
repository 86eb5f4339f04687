use mesh_core::{IdentityError, PeerId};
use thiserror::Error;

use crate::message::MessageType;

pub type Result<T, E = ConsensusError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("view change in progress")]
    ViewChangeInProgress,
    #[error("duplicate request {digest}")]
    DuplicateRequest { digest: String },
    #[error("conflicting pre-prepare in view {view} for {digest}: already at sequence {existing}, proposed {proposed}")]
    ConflictingPrePrepare { view: u64, digest: String, existing: u64, proposed: u64 },
    #[error("view mismatch: replica at {current}, message for {message}")]
    ViewMismatch { current: u64, message: u64 },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("unknown request {digest}")]
    UnknownRequest { digest: String },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected message type {0:?}")]
    UnexpectedMessageType(MessageType),
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),
    #[error("digest mismatch: message claims {claimed}, request hashes to {computed}")]
    DigestMismatch { claimed: String, computed: String },
    #[error("replica is not in an active view change")]
    ActiveViewAlready,
    #[error("wrong primary for view {view}: expected {expected}, got {got}")]
    WrongPrimary { view: u64, expected: PeerId, got: PeerId },
    #[error("insufficient view change quorum: have {have}, need {need}")]
    InsufficientViewChangeQuorum { have: usize, need: usize },
    #[error("view change for view {got} embedded in new view {expected}")]
    ViewChangeViewMismatch { expected: u64, got: u64 },
    #[error("sequence gap in new view: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("sequence {sequence} is beyond the window of {window} past last executed {last_executed}")]
    SequenceOutOfWindow { sequence: u64, last_executed: u64, window: u64 },
    #[error("view change for view {0} has not reached quorum")]
    ViewChangeNotReady(u64),
    #[error("invalid view change: {0}")]
    InvalidViewChange(String),
    #[error("invalid new view: {0}")]
    InvalidNewView(String),
    #[error("peer {0} is not part of the replica set")]
    UnknownReplica(PeerId),
    #[error("invalid peer id: {0}")]
    InvalidPeerId(#[from] IdentityError),
    #[error("replica {0} listed more than once")]
    DuplicateReplica(PeerId),
    #[error("need at least {need} replicas, got {have}")]
    NotEnoughReplicas { have: usize, need: usize },
    #[error("send to {peer} failed: {reason}")]
    Transport { peer: PeerId, reason: String },
    #[error("send to {peer} timed out after {timeout_ms}ms")]
    SendTimeout { peer: PeerId, timeout_ms: u64 },
    #[error("broadcast failed for {failed} of {total} replicas")]
    BroadcastFailed { failed: usize, total: usize },
    #[error("replica event loop stopped")]
    ReplicaStopped,
}
