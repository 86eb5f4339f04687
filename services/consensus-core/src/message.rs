//! PBFT message catalog and wire encoding.
//!
//! Every frame is a JSON object `{"type": <1..6>, "data": <payload>}` followed
//! by a newline. Type numbers are part of the wire contract:
//!
//! | type | message    |
//! |------|------------|
//! | 1    | Request    |
//! | 2    | PrePrepare |
//! | 3    | Prepare    |
//! | 4    | Commit     |
//! | 5    | ViewChange |
//! | 6    | NewView    |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mesh_core::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};
use crate::execution::{trim_frame, ExecutionRequest};

/// Slot in the total order.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageId {
    pub view: u64,
    pub sequence: u64,
}

impl MessageId {
    pub fn new(view: u64, sequence: u64) -> Self { Self { view, sequence } }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.view, self.sequence) }
}

/// Logical channel a frame arrived on. Only `Request` is valid on `General`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Consensus,
    General,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub origin: PeerId,
    pub execute: ExecutionRequest,
}

impl Request {
    pub fn new(origin: PeerId, execute: ExecutionRequest) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), timestamp: Utc::now(), origin, execute }
    }

    /// Placeholder proposed for sequence slots with no prepare evidence.
    pub fn null() -> Self {
        Self { id: String::new(), timestamp: DateTime::<Utc>::default(), origin: PeerId::default(), execute: ExecutionRequest::default() }
    }
}

/// Digest reserved for null requests.
pub const NULL_DIGEST: &str = "";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub request: Request,
    pub signature: String,
}

impl PrePrepare {
    pub fn id(&self) -> MessageId { MessageId::new(self.view, self.sequence) }
    pub fn is_null(&self) -> bool { self.digest == NULL_DIGEST }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub signature: String,
}

/// Evidence that a request was prepared: the PrePrepare plus a quorum of Prepares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareInfo {
    pub view: u64,
    pub sequence: u64,
    pub digest: String,
    pub preprepare: PrePrepare,
    pub prepares: BTreeMap<PeerId, Prepare>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub view: u64,
    pub prepares: Vec<PrepareInfo>,
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: u64,
    pub messages: BTreeMap<PeerId, ViewChange>,
    pub preprepares: Vec<PrePrepare>,
    pub signature: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    PrePrepare = 2,
    Prepare = 3,
    Commit = 4,
    ViewChange = 5,
    NewView = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ConsensusError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Request,
            2 => Self::PrePrepare,
            3 => Self::Prepare,
            4 => Self::Commit,
            5 => Self::ViewChange,
            6 => Self::NewView,
            other => return Err(ConsensusError::UnknownMessageType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    ViewChange(ViewChange),
    NewView(NewView),
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    kind: u8,
    data: T,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::PrePrepare(_) => MessageType::PrePrepare,
            Self::Prepare(_) => MessageType::Prepare,
            Self::Commit(_) => MessageType::Commit,
            Self::ViewChange(_) => MessageType::ViewChange,
            Self::NewView(_) => MessageType::NewView,
        }
    }

    /// Serialize to a newline terminated frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let kind = self.message_type() as u8;
        let mut buf = match self {
            Self::Request(m) => serde_json::to_vec(&Envelope { kind, data: m }),
            Self::PrePrepare(m) => serde_json::to_vec(&Envelope { kind, data: m }),
            Self::Prepare(m) => serde_json::to_vec(&Envelope { kind, data: m }),
            Self::Commit(m) => serde_json::to_vec(&Envelope { kind, data: m }),
            Self::ViewChange(m) => serde_json::to_vec(&Envelope { kind, data: m }),
            Self::NewView(m) => serde_json::to_vec(&Envelope { kind, data: m }),
        }?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Decode a frame received on the consensus channel.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let env: Envelope<serde_json::Value> = serde_json::from_slice(trim_frame(bytes))?;
        let data = env.data;
        Ok(match MessageType::try_from(env.kind)? {
            MessageType::Request => Self::Request(serde_json::from_value(data)?),
            MessageType::PrePrepare => Self::PrePrepare(serde_json::from_value(data)?),
            MessageType::Prepare => Self::Prepare(serde_json::from_value(data)?),
            MessageType::Commit => Self::Commit(serde_json::from_value(data)?),
            MessageType::ViewChange => Self::ViewChange(serde_json::from_value(data)?),
            MessageType::NewView => Self::NewView(serde_json::from_value(data)?),
        })
    }

    /// Decode a frame and check it is allowed on `channel`.
    pub fn decode_from(channel: Channel, bytes: &[u8]) -> Result<Self> {
        let msg = Self::decode(bytes)?;
        match (channel, &msg) {
            (Channel::Consensus, _) | (Channel::General, Self::Request(_)) => Ok(msg),
            (Channel::General, other) => Err(ConsensusError::UnexpectedMessageType(other.message_type())),
        }
    }
}
