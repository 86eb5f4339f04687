//! PBFT replica state machine.
//!
//! A `Replica` is driven by exactly one task (see `node::spawn_replica`); each
//! inbound message or timer expiry is handled to completion before the next
//! one, so handlers take `&mut self` and need no further locking.

mod execute;
mod normal;
mod view_change;

use std::sync::Arc;

use mesh_core::{Keypair, PeerId};
use serde::Serialize;
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, info, warn};

use crate::config::{PostProcessor, ReplicaConfig};
use crate::crypto::request_digest;
use crate::error::{ConsensusError, Result};
use crate::execution::Executor;
use crate::message::{Channel, Message, Request};
use crate::messaging::{Messaging, Transport};
use crate::node::Event;
use crate::quorum::ProtocolParameters;
use crate::state::ReplicaState;
use crate::timer::RequestTimer;

/// Point-in-time view of a replica for callers outside the event loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub id: PeerId,
    pub view: u64,
    pub active_view: bool,
    pub sequence: u64,
    pub last_executed: u64,
    pub pending: usize,
    pub primary: PeerId,
}

pub struct Replica {
    id: PeerId,
    key: Keypair,
    params: ProtocolParameters,
    state: ReplicaState,
    messaging: Messaging,
    executor: Arc<dyn Executor>,
    timer: RequestTimer,
    sequence_window: u64,
    post_processors: Vec<Arc<dyn PostProcessor>>,
}

impl Replica {
    /// `replicas` must list the cluster in the same order on every member.
    pub fn new(
        key: Keypair,
        replicas: Vec<PeerId>,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        config: ReplicaConfig,
        events: WeakUnboundedSender<Event>,
    ) -> Result<Self> {
        let id = key.peer_id();
        let params = ProtocolParameters::new(replicas)?;
        if !params.contains(&id) {
            return Err(ConsensusError::UnknownReplica(id));
        }
        let messaging = Messaging::new(id, params.replicas().to_vec(), transport, config.network_timeout);
        info!(replica = %id.short(), n = params.n(), f = params.f(), "replica_created");
        Ok(Self {
            id,
            key,
            params,
            state: ReplicaState::default(),
            messaging,
            executor,
            timer: RequestTimer::new(config.request_timeout, events),
            sequence_window: config.sequence_window,
            post_processors: config.post_processors,
        })
    }

    pub fn id(&self) -> PeerId { self.id }

    pub fn current_primary(&self) -> PeerId { self.params.primary_for(self.state.view) }

    fn is_primary(&self) -> bool { self.current_primary() == self.id }

    fn check_window(&self, sequence: u64) -> Result<()> {
        let last_executed = self.state.last_executed;
        if sequence > last_executed.saturating_add(self.sequence_window) {
            return Err(ConsensusError::SequenceOutOfWindow { sequence, last_executed, window: self.sequence_window });
        }
        Ok(())
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            id: self.id,
            view: self.state.view,
            active_view: self.state.active_view,
            sequence: self.state.sequence,
            last_executed: self.state.last_executed,
            pending: self.state.pending.len(),
            primary: self.current_primary(),
        }
    }

    /// Decode one inbound frame and route it to its phase handler.
    pub async fn process_message(&mut self, from: PeerId, channel: Channel, payload: &[u8]) -> Result<()> {
        let msg = Message::decode_from(channel, payload)?;
        if !matches!(msg, Message::Request(_)) && !self.params.contains(&from) {
            return Err(ConsensusError::UnknownReplica(from));
        }
        match msg {
            Message::Request(m) => self.process_request(from, m).await,
            Message::PrePrepare(m) => self.process_pre_prepare(from, m).await,
            Message::Prepare(m) => self.process_prepare(from, m).await,
            Message::Commit(m) => self.process_commit(from, m).await,
            Message::ViewChange(m) => self.process_view_change(from, m).await,
            Message::NewView(m) => self.process_new_view(from, m).await,
        }
    }

    pub async fn process_request(&mut self, from: PeerId, request: Request) -> Result<()> {
        if !self.state.active_view {
            return Err(ConsensusError::ViewChangeInProgress);
        }
        if let Some(response) = self.state.executions.get(&request.id).cloned() {
            debug!(request_id = %request.id, "request_already_executed");
            if let Err(err) = self.messaging.send_response(request.origin, &response).await {
                warn!(request_id = %request.id, error = %err, "cached_response_send_failed");
            }
            return Err(ConsensusError::DuplicateRequest { digest: request_digest(&request)? });
        }
        if !self.is_primary() {
            self.timer.start(false);
            debug!(request_id = %request.id, from = %from.short(), primary = %self.current_primary().short(), "request_left_to_primary");
            return Ok(());
        }
        let digest = request_digest(&request)?;
        if self.state.sequence_of(self.state.view, &digest).is_some() {
            return Err(ConsensusError::DuplicateRequest { digest });
        }
        debug!(request_id = %request.id, digest = %digest, "request_received");
        self.send_pre_prepare(request, digest).await
    }

    /// Handle a request timer expiry posted by `RequestTimer`.
    pub async fn on_request_timeout(&mut self, generation: u64) {
        if !self.timer.fire(generation) {
            debug!(generation, "stale_request_timeout");
            return;
        }
        let next = self.state.view + 1;
        warn!(replica = %self.id.short(), view = self.state.view, pending = self.state.pending.len(), "request_timeout");
        if let Err(err) = self.start_view_change(next).await {
            warn!(view = next, error = %err, "view_change_broadcast_failed");
        }
    }

    pub fn shutdown(&mut self) {
        self.timer.stop();
        info!(replica = %self.id.short(), view = self.state.view, last_executed = self.state.last_executed, "replica_stopped");
    }
}
