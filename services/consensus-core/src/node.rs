//! Event loop that owns a replica.

use std::sync::Arc;

use mesh_core::{Keypair, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReplicaConfig;
use crate::error::{ConsensusError, Result};
use crate::execution::Executor;
use crate::message::Channel;
use crate::messaging::Transport;
use crate::replica::{Replica, ReplicaStatus};

#[derive(Debug)]
pub enum Event {
    Inbound { from: PeerId, channel: Channel, payload: Vec<u8> },
    RequestTimeout { generation: u64 },
    Status(oneshot::Sender<ReplicaStatus>),
    Shutdown,
}

/// Cheap cloneable handle used by transports and callers to reach a replica.
#[derive(Clone, Debug)]
pub struct ReplicaHandle {
    id: PeerId,
    events: mpsc::UnboundedSender<Event>,
}

impl ReplicaHandle {
    pub fn id(&self) -> PeerId { self.id }

    pub fn deliver(&self, from: PeerId, channel: Channel, payload: Vec<u8>) -> Result<()> {
        self.events.send(Event::Inbound { from, channel, payload }).map_err(|_| ConsensusError::ReplicaStopped)
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Status(tx)).map_err(|_| ConsensusError::ReplicaStopped)?;
        rx.await.map_err(|_| ConsensusError::ReplicaStopped)
    }

    pub fn shutdown(&self) -> Result<()> { self.events.send(Event::Shutdown).map_err(|_| ConsensusError::ReplicaStopped) }
}

/// Build a replica and spawn the task that drives it.
pub fn spawn_replica(
    key: Keypair,
    replicas: Vec<PeerId>,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    config: ReplicaConfig,
) -> Result<(ReplicaHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let replica = Replica::new(key, replicas, transport, executor, config, tx.downgrade())?;
    let handle = ReplicaHandle { id: replica.id(), events: tx };
    let task = tokio::spawn(run(replica, rx));
    Ok((handle, task))
}

async fn run(mut replica: Replica, mut events: mpsc::UnboundedReceiver<Event>) {
    let id = replica.id();
    info!(replica = %id.short(), "replica_loop_started");
    while let Some(event) = events.recv().await {
        match event {
            Event::Inbound { from, channel, payload } => {
                if let Err(err) = replica.process_message(from, channel, &payload).await {
                    match &err {
                        ConsensusError::DuplicateRequest { .. } | ConsensusError::ViewChangeInProgress => {
                            debug!(replica = %id.short(), from = %from.short(), error = %err, "message_rejected")
                        }
                        _ => warn!(replica = %id.short(), from = %from.short(), error = %err, "message_rejected"),
                    }
                }
            }
            Event::RequestTimeout { generation } => replica.on_request_timeout(generation).await,
            Event::Status(reply) => {
                let _ = reply.send(replica.status());
            }
            Event::Shutdown => break,
        }
    }
    replica.shutdown();
}
