//! Outbound side of a replica: framing, timeouts and fan-out over a `Transport`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mesh_core::PeerId;
use tracing::warn;

use crate::error::{ConsensusError, Result};
use crate::execution::ExecutionResponse;
use crate::message::{Channel, Message};

/// Point-to-point byte delivery between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, target: PeerId, channel: Channel, payload: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Messaging {
    local: PeerId,
    replicas: Vec<PeerId>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Messaging {
    pub fn new(local: PeerId, replicas: Vec<PeerId>, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { local, replicas, transport, timeout }
    }

    async fn send_bytes(&self, target: PeerId, channel: Channel, payload: Vec<u8>) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.transport.send_message(target, channel, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConsensusError::Transport { peer: target, reason: e.to_string() }),
            Err(_) => Err(ConsensusError::SendTimeout { peer: target, timeout_ms: self.timeout.as_millis() as u64 }),
        }
    }

    pub async fn send(&self, target: PeerId, msg: &Message) -> Result<()> {
        self.send_bytes(target, Channel::Consensus, msg.encode()?).await
    }

    /// Send to every other replica concurrently. All sends are attempted even
    /// when some fail.
    pub async fn broadcast(&self, msg: &Message) -> Result<()> {
        let payload = msg.encode()?;
        let targets: Vec<PeerId> = self.replicas.iter().copied().filter(|p| *p != self.local).collect();
        let sends = targets.iter().map(|t| self.send_bytes(*t, Channel::Consensus, payload.clone()));
        let results = join_all(sends).await;
        let mut failed = 0;
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!(kind = ?msg.message_type(), error = %err, "broadcast_send_failed");
            failed += 1;
        }
        if failed > 0 {
            return Err(ConsensusError::BroadcastFailed { failed, total: targets.len() });
        }
        Ok(())
    }

    pub async fn send_response(&self, origin: PeerId, response: &ExecutionResponse) -> Result<()> {
        self.send_bytes(origin, Channel::General, response.encode()?).await
    }
}
