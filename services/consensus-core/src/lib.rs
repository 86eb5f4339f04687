//! PBFT replica for compute-mesh execution clusters.
//!
//! A cluster of `n >= 4` replicas agrees on the order of function execution
//! requests, executes them and returns each replica's result to the origin.
//! Up to `f = (n-1)/3` Byzantine replicas are tolerated.

pub mod config;
pub mod crypto;
pub mod error;
pub mod execution;
pub mod local;
pub mod message;
pub mod messaging;
pub mod node;
pub mod quorum;
pub mod replica;
pub mod state;
pub mod timer;

pub use config::{PostProcessor, ReplicaConfig, MINIMUM_REPLICA_COUNT};
pub use crypto::{request_digest, sign, verify_signature, Signable};
pub use error::{ConsensusError, Result};
pub use execution::{
    EchoExecutor, ExecutionRequest, ExecutionResponse, ExecutionResult, Executor, ResultCode,
};
pub use local::LocalNetwork;
pub use message::{Channel, Commit, Message, MessageId, MessageType, NewView, PrePrepare, Prepare, PrepareInfo, Request, ViewChange};
pub use messaging::{Messaging, Transport};
pub use node::{spawn_replica, Event, ReplicaHandle};
pub use quorum::{fault_tolerance, ProtocolParameters};
pub use replica::{Replica, ReplicaStatus};
